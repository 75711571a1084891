use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::mpsc,
    thread,
};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use daikin_s21::{
    s21::{self, frame, Command, StatusReport},
    AcState, AcStateMachine, DriverConfig, FanSpeed, Mode, TransportConfig,
};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "s21ctl", about = "Talk to a Daikin unit over its S21 port")]
struct Cli {
    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Poll the unit and print every state change, until stdin closes
    Run {
        /// serial:<path> or gpio:<tx>:<rx>, overrides the config file
        #[arg(short, long)]
        transport: Option<TransportConfig>,

        /// JSON driver config
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Decode hex-encoded frames read from stdin, one per line
    Decode,

    /// Print a frame as hex
    Encode {
        /// Two character command, e.g. F1
        command: Command,

        /// Hex payload
        #[arg(default_value = "")]
        payload: String,
    },

    /// Print the control frame that would set the given state
    Control {
        #[arg(long)]
        power: bool,

        #[arg(long, default_value = "auto")]
        mode: Mode,

        #[arg(long, default_value_t = 22.0)]
        temp: f32,

        #[arg(long, default_value = "auto")]
        fan: FanSpeed,
    },
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Action::Run {
            transport,
            config,
            interval_ms,
        } => run(transport, config, interval_ms),
        Action::Decode => decode(),
        Action::Encode { command, payload } => {
            let payload = hex::decode(payload)?;
            println!("{}", hex::encode(frame::encode(command, &payload)?));
            Ok(())
        }
        Action::Control {
            power,
            mode,
            temp,
            fan,
        } => {
            let state = AcState {
                power,
                mode,
                target_temperature: temp,
                fan_speed: fan,
                ..Default::default()
            };
            let payload = s21::control_payload(&state);
            println!("{}", hex::encode(frame::encode(Command::CONTROL, &payload)?));
            Ok(())
        }
    }
}

fn run(
    transport: Option<TransportConfig>,
    config: Option<PathBuf>,
    interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    if let Some(ms) = interval_ms {
        config.poll_interval_ms = ms;
    }

    let transport = match transport {
        Some(transport) => transport,
        None => config
            .transport_config()?
            .ok_or_else(|| anyhow!("no transport given, use --transport or the config file"))?,
    };

    let transport = daikin_s21::open_transport(&transport)?;
    let machine = AcStateMachine::from_config(transport, &config);
    let handle = machine.handle();
    handle.on_state_change(|state| {
        if let Ok(json) = serde_json::to_string(state) {
            println!("{}", json);
            let _ = io::stdout().flush();
        }
    });

    let task = machine
        .spawn(config.poll_interval())
        .context("failed to start poll thread")?;

    // Block until stdin closes
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        for _ in io::stdin().lock().lines() {}
        let _ = done_tx.send(());
    });
    let _ = done_rx.recv();

    info!("stopping");
    task.stop();
    Ok(())
}

fn decode() -> anyhow::Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let bytes = hex::decode(line)?;
        match frame::decode(&bytes) {
            Ok(frame) => {
                println!(
                    "{} {:?}",
                    frame.command,
                    String::from_utf8_lossy(&frame.payload)
                );
                match frame.command {
                    Command::STATUS_REPLY | Command::STATUS_REPLY_ALT => {
                        println!("{:?}", StatusReport::try_from(frame.payload.as_ref()))
                    }
                    Command::SENSOR_REPLY => {
                        println!("{:?}", s21::decode_sensor_temperature(&frame.payload))
                    }
                    _ => {}
                }
            }
            Err(e) => println!("error: {}", e),
        }
        io::stdout().flush()?;
    }

    Ok(())
}
