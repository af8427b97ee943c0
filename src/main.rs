mod config;
mod core;
mod logging;

use anyhow::Result;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("aircue failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "aircue.toml".to_string();
    let mut debug = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--debug" => {
                debug = true;
                i += 1;
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                i += 1;
            }
        }
    }

    logging::init(debug);

    let config = config::Config::load(&config_path).await?;
    core::run(config).await
}
