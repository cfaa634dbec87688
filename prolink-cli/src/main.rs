use anyhow::Result;
use prolink_core::{Config, Engine, SubscriptionKind};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(about = "prolink position & identity core demonstrator")]
struct Opt {
    /// Name this process announces itself under.
    #[structopt(long, default_value = "prolink-cli")]
    name: String,

    /// Device number to claim on the network.
    #[structopt(long, default_value = "5")]
    device_num: u8,

    /// Network interface to join on; defaults to the first IPv4 interface.
    #[structopt(long)]
    interface: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let config = Config {
        name: opt.name,
        device_num: opt.device_num,
        interface_name: opt.interface,
        ..Config::default()
    };

    let engine = Engine::join(config).await?;
    println!("joined network");

    let mut peer_events = engine.peer_events();
    let mut movement = engine.subscribe(SubscriptionKind::Movement, None, std::time::Duration::from_millis(50));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            res = peer_events.recv() => {
                if let Ok(event) = res {
                    println!("peer event: {:?}", event);
                }
            }
            res = movement.recv() => {
                if let Some(event) = res {
                    println!("movement: {:?}", event);
                }
            }
        }
    }

    println!("terminating");
    engine.terminate().await;
    Ok(())
}
