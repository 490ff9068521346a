use canopen_commission::{
    sim::{SimBus, SimNode},
    slaveinfo, LoopOutcome,
};
use std::{env, io, time::Duration};

pub fn main() -> Result<(), io::Error> {
    env_logger::init();
    let args: Vec<_> = env::args().collect();
    if args.len() > 4 {
        println!("usage: {} [CANIF] [NODE] [BITRATE]", env!("CARGO_PKG_NAME"));
        return Ok(());
    }
    let canif = args.get(1).map(String::as_str).unwrap_or("can0");
    let node = parse(args.get(2), 1)?;
    let bitrate = parse(args.get(3), 1_000_000)?;

    let mut bus = SimBus::new()
        .with_node(SimNode::drive(1).with_identity("Simulated drive", "HW 1.0", "SW 2.3"))
        .realtime(Duration::from_millis(2));
    let report = slaveinfo(&mut bus, canif, node, bitrate)?;

    for slave in &report.nodes {
        log::info!("Node {}: {:?}", slave.id, slave.identity);
    }
    if let LoopOutcome::Completed { cycles, counter } = report.outcome {
        log::info!("{} cycles, counter {}", cycles, counter);
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(arg: Option<&String>, default: T) -> io::Result<T> {
    match arg {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid number: {}", s))
        }),
    }
}
