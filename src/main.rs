use crabstream::config::AppConfig;
use crabstream::supervisor::Supervisor;
use std::env;

fn print_banner(config: &AppConfig) {
    log::info!("crabstream v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Configuration:");
    log::info!("  Signaling port : {}", config.server.signaling_port);
    log::info!(
        "  RTSP URL       : {}",
        if config.test_mode() {
            "(test mode)"
        } else {
            &config.rtsp.url
        }
    );
    log::info!("  Transport      : {}", config.rtsp.transport);
    log::info!(
        "  Bitrate        : {} kbps (min: {}, max: {})",
        config.webrtc.video.bitrate_kbps,
        config.webrtc.video.min_bitrate_kbps,
        config.webrtc.video.max_bitrate_kbps
    );
    log::info!("  Max peers      : {}", config.webrtc.max_peers);
    log::info!("  STUN           : {}", config.webrtc.stun_server);
    log::info!(
        "  TURN           : {}",
        if config.webrtc.turn_server.is_empty() {
            "(disabled)"
        } else {
            &config.webrtc.turn_server
        }
    );
    log::info!(
        "  Encoding       : {}{}",
        if config.encoding.passthrough {
            "passthrough"
        } else {
            "re-encode"
        },
        if config.encoding.hw_encode {
            " (hw units)"
        } else {
            ""
        }
    );
}

fn print_help() {
    println!("Usage: crabstream [options]");
    println!("Options:");
    println!("  -c, --config <path>    Config file (default: crabstream.toml)");
    println!("  -h, --help             Show this help");
    println!();
    println!("Environment variables:");
    println!("  RTSP_URL               RTSP camera URL");
    println!("  SIGNALING_PORT         WebSocket signaling port");
    println!("  STUN_SERVER            STUN server URL");
    println!("  TURN_SERVER            TURN server URL");
    println!("  TURN_USERNAME          TURN username");
    println!("  TURN_CREDENTIAL        TURN credential");
    println!("  VIDEO_BITRATE_KBPS     Video bitrate in kbps");
    println!("  VIDEO_MAX_BITRATE_KBPS Max video bitrate in kbps");
    println!("  LOG_LEVEL              Log level (trace/debug/info/warn/error)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let mut config_path = "crabstream.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" if i + 1 < args.len() => {
                config_path = args[i + 1].clone();
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    // Config load failures are the only fatal startup path besides binding
    let config = match AppConfig::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.logging.level)
        .init();

    print_banner(&config);

    let signaling_port = config.server.signaling_port;
    let supervisor = Supervisor::new(config);
    if let Err(e) = supervisor.start().await {
        log::error!("Startup failed: {}", e);
        std::process::exit(1);
    }

    log::info!("WebSocket signaling: ws://0.0.0.0:{}", signaling_port);

    tokio::signal::ctrl_c().await?;
    log::info!("Received ctrl-c, shutting down gracefully...");

    supervisor.stop().await;
    Ok(())
}
