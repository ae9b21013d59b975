use log::info;
use weld::{link, parse_opts};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    info!("launched with args: {:?}", args);

    let opt = parse_opts(&args)?;
    info!("parsed options: {opt:?}");

    link::link(&opt)
}
