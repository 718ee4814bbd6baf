use clap::Parser;
use docsync::{ClientOptions, SyncClient};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "watch_doc")]
#[command(about = "Print every update of one live document")]
struct Args {
    /// Backend authority (e.g., localhost:8080)
    authority: String,

    /// Document domain
    domain: String,

    /// Document name
    name: String,

    /// Use ws:// and http:// instead of wss:// and https://
    #[arg(long)]
    insecure: bool,

    /// Auth token sent with the subscription
    #[arg(long)]
    auth: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();

    let client = SyncClient::new(ClientOptions::new(args.authority).with_ssl(!args.insecure))?;
    let mut connectivity = client.connectivity();
    let mut doc = client.observe_doc(args.domain, args.name, args.auth)?;
    client.connect()?;

    info!("Watching '{}', press Ctrl-C to stop", doc.key());

    loop {
        tokio::select! {
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *connectivity.borrow_and_update();
                info!("Connectivity: {}", if online { "online" } else { "offline" });
            }

            value = doc.next_value() => match value {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value.fields)?),
                None => break,
            },

            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
