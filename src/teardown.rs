// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Undo SYNC, PDO and heartbeat setup after the control loop.

use crate::{
    configure::{ConfiguredSlave, SYNC_COB_ID, SYNC_PERIOD},
    master::Master,
    transport::Network,
    types::*,
};

const HEARTBEAT_PRODUCER: ObjectAddress = ObjectAddress {
    index: 0x1017,
    sub: 0,
};

pub struct Teardown {
    sync: SyncConfig,
}

impl Teardown {
    pub fn new(sync: SyncConfig) -> Self {
        Self { sync }
    }

    /// Release all `slaves`. Every step is attempted; the first failure is
    /// returned.
    pub fn run<N: Network>(
        &self,
        master: &mut Master<N>,
        slaves: &[ConfiguredSlave],
    ) -> Result<()> {
        let mut first = None;
        if self.sync.mode == SyncMode::MasterGenerated && !slaves.is_empty() {
            keep_first(&mut first, master.local_restore(SYNC_COB_ID));
            keep_first(&mut first, master.local_restore(SYNC_PERIOD));
        }
        for slave in slaves {
            keep_first(&mut first, self.release(master, slave));
        }
        first.map_or(Ok(()), Err)
    }

    /// Invalidate both PDOs and silence the heartbeat of one slave. SYNC
    /// production is stopped first if the slave is the producer.
    pub fn release<N: Network>(
        &self,
        master: &mut Master<N>,
        slave: &ConfiguredSlave,
    ) -> Result<()> {
        let node = slave.node;
        log::info!("Releasing node {}", node);
        let mut first = None;
        if slave.sync_producer {
            let cob_id = self.sync.cob_id.raw() & !CobId::GENERATE;
            keep_first(
                &mut first,
                master.sdo_download(node, ObjectAddress::new(SYNC_COB_ID, 0), &cob_id),
            );
        }
        for channel in [slave.feedback, slave.command] {
            let cob_id = channel.cob_id(node).disabled().raw();
            keep_first(&mut first, master.sdo_download(node, channel.cob_addr(), &cob_id));
        }
        keep_first(&mut first, master.sdo_download(node, HEARTBEAT_PRODUCER, &0u16));
        first.map_or(Ok(()), Err)
    }
}

fn keep_first(first: &mut Option<Error>, result: Result<()>) {
    if let Err(e) = result {
        log::warn!("Teardown: {}", e);
        first.get_or_insert(e);
    }
}
