// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{config::RetryPolicy, transport::Network, types::*};
use std::thread;

/// Repeat a transfer while it fails with a transient fault and attempts are
/// left, then map the final fault with `$err`.
macro_rules! transfer {
    ($m:expr, $what:expr, $call:expr, $err:expr) => {{
        let mut attempt = 1;
        loop {
            match $call {
                Ok(v) => break Ok(v),
                Err(fault) if fault.is_transient() && attempt < $m.retry.attempts => {
                    log::warn!(
                        "{} failed ({}), retry {}/{}",
                        $what,
                        fault,
                        attempt,
                        $m.retry.attempts - 1
                    );
                    attempt += 1;
                    if !$m.retry.backoff.is_zero() {
                        thread::sleep($m.retry.backoff);
                    }
                }
                Err(fault) => break Err($err(fault)),
            }
        }
    }};
}

/// The master side of a network, with every configuration write checked.
pub struct Master<N> {
    net: N,
    retry: RetryPolicy,
}

impl<N: Network> Master<N> {
    pub fn new(net: N, retry: RetryPolicy) -> Self {
        Self { net, retry }
    }

    pub fn network(&self) -> &N {
        &self.net
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn into_network(self) -> N {
        self.net
    }

    pub fn nmt(&mut self, cmd: NmtCommand, node: Option<NodeId>) -> Result<()> {
        log::debug!("NMT {:?} to {:?}", cmd, node);
        let net = &mut self.net;
        transfer!(self, format_args!("NMT {:?}", cmd), net.nmt(cmd, node), |fault| {
            Error::Nmt { cmd, fault }
        })
    }

    pub fn node_next(&mut self, from: u8) -> Option<NodeId> {
        self.net.node_next(from)
    }

    pub fn node_count(&self) -> usize {
        self.net.node_count()
    }

    pub fn node_check(&mut self, node: NodeId) -> bool {
        self.net.node_check(node)
    }

    /// Single, unretried read; the slice is empty if nothing was returned.
    pub fn sdo_upload<'t>(
        &mut self,
        node: NodeId,
        addr: ObjectAddress,
        target: &'t mut [u8],
    ) -> Result<&'t [u8]> {
        let n = self
            .net
            .sdo_upload(node, addr, target)
            .map_err(|fault| Error::Sdo { node, addr, fault })?;
        Ok(&target[..n.min(target.len())])
    }

    pub fn sdo_download<T>(&mut self, node: NodeId, addr: ObjectAddress, data: &T) -> Result<()>
    where
        T: SdoData + ?Sized,
    {
        let bytes = data.to_wire();
        log::debug!("SDO {} {} <- {:02X?}", node, addr, bytes);
        let net = &mut self.net;
        transfer!(
            self,
            format_args!("SDO write {} {}", node, addr),
            net.sdo_download(node, addr, &bytes),
            |fault| Error::Sdo { node, addr, fault }
        )
        .map(|_| ())
    }

    pub fn local_write(&mut self, addr: ObjectAddress, value: u32) -> Result<()> {
        log::debug!("Local {} <- 0x{:08X}", addr, value);
        let net = &mut self.net;
        transfer!(
            self,
            format_args!("Local write {}", addr),
            net.local_write(addr, value),
            |fault| Error::Local { addr, fault }
        )
    }

    pub fn local_restore(&mut self, index: u16) -> Result<()> {
        log::debug!("Local 0x{:04X} restored", index);
        let addr = ObjectAddress::new(index, 0);
        let net = &mut self.net;
        transfer!(
            self,
            format_args!("Local restore {}", addr),
            net.local_restore(index),
            |fault| Error::Local { addr, fault }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimEvent, SimNode};
    use crate::transport::Bus;

    fn master(bus: &mut SimBus, retry: RetryPolicy) -> Master<crate::sim::SimNetwork> {
        let cfg = bus.net_config();
        let net = bus.init(&cfg).unwrap();
        Master::new(net, retry)
    }

    #[test]
    fn transient_faults_are_retried() {
        let mut bus = SimBus::new().with_node(SimNode::drive(1));
        let node = NodeId::try_from(1).unwrap();
        let addr = ObjectAddress::new(0x1017, 0);
        bus.inject_fault(1, addr, SdoFault::Timeout, 2);
        let mut m = master(&mut bus, RetryPolicy { attempts: 3, ..RetryPolicy::none() });
        m.sdo_download(node, addr, &5u16).unwrap();
        let writes = bus
            .events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::Download { addr: a, .. } if *a == addr))
            .count();
        assert_eq!(writes, 3);
    }

    #[test]
    fn retries_are_bounded() {
        let mut bus = SimBus::new().with_node(SimNode::drive(1));
        let node = NodeId::try_from(1).unwrap();
        let addr = ObjectAddress::new(0x1017, 0);
        bus.inject_fault(1, addr, SdoFault::Unreachable, 5);
        let mut m = master(&mut bus, RetryPolicy { attempts: 2, ..RetryPolicy::none() });
        let err = m.sdo_download(node, addr, &5u16).unwrap_err();
        assert!(matches!(
            err,
            Error::Sdo {
                fault: SdoFault::Unreachable,
                ..
            }
        ));
    }

    #[test]
    fn rejected_writes_fail_at_once() {
        let mut bus = SimBus::new().with_node(SimNode::drive(1));
        let node = NodeId::try_from(1).unwrap();
        let addr = ObjectAddress::new(0x1A00, 1);
        bus.inject_fault(1, addr, SdoFault::AccessDenied(SdoFault::ABORT_READ_ONLY), 1);
        let mut m = master(&mut bus, RetryPolicy::default());
        let err = m.sdo_download(node, addr, &0x6041_0010u32).unwrap_err();
        assert!(matches!(
            err,
            Error::Sdo {
                fault: SdoFault::AccessDenied(_),
                ..
            }
        ));
        let writes = bus
            .events()
            .into_iter()
            .filter(|e| matches!(e, SimEvent::Download { .. }))
            .count();
        assert_eq!(writes, 1);
    }
}
