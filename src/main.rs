mod cli;

use std::io;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::CommandFactory;
use clap_complete::{generate, shells::Bash};
use itertools::Itertools;
use log::{debug, error};

use cavro::config::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};
use cavro::protocol::{InitDirection, QueryKind, Sequence, ValveDirection};
use cavro::regs::RegisterModel;
use cavro::{port, Address, Bus, DeviceConfig, Outcome, Primitive, ProtocolConfig, Transport};

use cli::{Cli, Commands, Parser, QuerySpec};

enum OutputFormat {
    Plain,
    Json,
}

fn device_config(cli: &Cli, address: Address) -> DeviceConfig {
    let mut config = DeviceConfig::new(address).with_ports(1..=cli.ports);
    config.max_steps = cli.max_steps;
    config.timeout = Duration::from_millis(cli.timeout);
    config.max_attempts = cli.attempts;
    config
}

fn render(results: &[(Address, Outcome)], fmt: &OutputFormat) -> String {
    match fmt {
        OutputFormat::Plain => results
            .iter()
            .map(|(address, outcome)| {
                let text = if outcome.data.is_empty() {
                    outcome.status.to_string()
                } else {
                    outcome.data.clone()
                };
                if results.len() > 1 {
                    format!("{}: {}", address, text)
                } else {
                    text
                }
            })
            .join("\n"),
        OutputFormat::Json => json::stringify(
            results
                .iter()
                .map(|(address, outcome)| {
                    json::object! {
                        address: address.switch(),
                        ready: outcome.status.is_ready(),
                        error: outcome.status.error.map(|e| e.to_string()),
                        data: outcome.data.as_str(),
                        estimate_ms: outcome.estimate.as_millis() as u64,
                    }
                })
                .collect::<Vec<_>>(),
        ),
    }
}

/// Runs `f` once per pump, in address order.
fn for_each<T, F>(bus: &mut Bus<T>, addresses: &[Address], mut f: F) -> Result<Vec<(Address, Outcome)>>
where
    T: Transport,
    F: FnMut(&mut Bus<T>, Address) -> Result<Outcome>,
{
    addresses
        .iter()
        .map(|&address| {
            let outcome =
                f(&mut *bus, address).with_context(|| format!("Failed to command pump {}", address))?;
            Ok((address, outcome))
        })
        .collect()
}

/// Sends an action chain to every pump, failing on a reported error.
fn cmd_action<T, F>(
    bus: &mut Bus<T>,
    addresses: &[Address],
    wait: bool,
    fmt: OutputFormat,
    mut chain: F,
) -> Result<String>
where
    T: Transport,
    F: FnMut(&mut Bus<T>, Address) -> Result<Vec<Primitive>>,
{
    let mut results = for_each(bus, addresses, |bus, address| {
        let steps = chain(&mut *bus, address)?;
        Ok(bus.run(address, &steps)?)
    })?;

    for (address, outcome) in results.iter_mut() {
        if let Some(error) = outcome.status.error {
            return Err(anyhow!("Pump {} reported {}", address, error));
        }
        if wait {
            outcome.status = bus
                .wait_ready(*address, DEFAULT_WAIT_TIMEOUT, DEFAULT_POLL_INTERVAL)
                .with_context(|| format!("Failed waiting for pump {}", address))?;
        }
    }

    Ok(render(&results, &fmt))
}

/// Reads plunger and valve so relative moves and valve choices start from
/// what the pump reports.
fn sync_position<T: Transport>(bus: &mut Bus<T>, address: Address) -> Result<()> {
    for kind in [QueryKind::PlungerPosition, QueryKind::ValvePosition] {
        let outcome = bus
            .query(address, kind)
            .with_context(|| format!("Failed to read {} from pump {}", kind.mnemonic(), address))?;
        debug!("pump {} {} = {}", address, kind.mnemonic(), outcome.data);
    }
    Ok(())
}

fn relative_move<T: Transport>(
    bus: &mut Bus<T>,
    address: Address,
    steps: i32,
    port: Option<u8>,
) -> Result<Vec<Primitive>> {
    sync_position(bus, address)?;
    let mut chain = Vec::new();
    if let Some(port) = port {
        chain.push(Primitive::valve(port));
    }
    chain.push(Primitive::MoveRelative(steps));
    Ok(chain)
}

fn step_count(steps: u32) -> Result<i32> {
    i32::try_from(steps).with_context(|| format!("Step count {} out of range", steps))
}

fn cmd_speed<T: Transport>(
    bus: &mut Bus<T>,
    addresses: &[Address],
    steps: Vec<Primitive>,
    microstep: Option<bool>,
    fmt: OutputFormat,
) -> Result<String> {
    if let Some(enable) = microstep {
        // microstep mode has to travel alone
        for_each(bus, addresses, |bus, address| {
            Ok(bus.run(address, &[Primitive::SetMicrostep(enable)])?)
        })?;
    }
    if steps.is_empty() {
        return match microstep {
            Some(_) => cmd_status(bus, addresses, fmt),
            None => Err(anyhow!("Nothing to set")),
        };
    }
    cmd_action(bus, addresses, false, fmt, |_, _| Ok(steps.clone()))
}

fn cmd_status<T: Transport>(bus: &mut Bus<T>, addresses: &[Address], fmt: OutputFormat) -> Result<String> {
    let results = for_each(bus, addresses, |bus, address| {
        Ok(bus.run(address, &[Primitive::QueryStatus])?)
    })?;
    Ok(render(&results, &fmt))
}

fn cmd_query<T: Transport>(
    bus: &mut Bus<T>,
    addresses: &[Address],
    kinds: &[QuerySpec],
    fmt: OutputFormat,
) -> Result<String> {
    let mut rows = Vec::new();
    for &address in addresses {
        for &QuerySpec(kind) in kinds {
            let outcome = bus
                .query(address, kind)
                .with_context(|| format!("Failed to read {} from pump {}", kind.mnemonic(), address))?;
            if let Some(error) = outcome.status.error {
                return Err(anyhow!("Pump {} reported {}", address, error));
            }
            rows.push((address, kind, outcome));
        }
    }

    Ok(match fmt {
        OutputFormat::Plain => rows
            .iter()
            .map(|(address, kind, outcome)| {
                if rows.len() > 1 {
                    format!("{} {}: {}", address, kind.mnemonic(), outcome.data)
                } else {
                    outcome.data.clone()
                }
            })
            .join("\n"),
        OutputFormat::Json => json::stringify(
            rows.iter()
                .map(|(address, kind, outcome)| {
                    json::object! {
                        address: address.switch(),
                        query: kind.mnemonic(),
                        value: outcome.value(),
                        data: outcome.data.as_str(),
                    }
                })
                .collect::<Vec<_>>(),
        ),
    })
}

fn cmd_wait<T: Transport>(
    bus: &mut Bus<T>,
    addresses: &[Address],
    limit: Duration,
    interval: Duration,
    fmt: OutputFormat,
) -> Result<String> {
    let results = for_each(bus, addresses, |bus, address| {
        let status = bus.wait_ready(address, limit, interval)?;
        Ok(Outcome {
            status,
            data: String::new(),
            estimate: Duration::ZERO,
        })
    })?;
    Ok(render(&results, &fmt))
}

/// Encodes a chain against an unknown pump state without touching the port.
fn cmd_dry_run(cli: &Cli, steps: &[Primitive]) -> Result<String> {
    cli.addresses
        .iter()
        .map(|&address| -> Result<String> {
            let model = RegisterModel::new(device_config(cli, address));
            let mut chain = model.chain();
            for &step in steps {
                chain
                    .push(step)
                    .with_context(|| format!("Cannot add {} for pump {}", step, address))?;
            }
            let frame = chain.finalize()?;
            Ok(hex::encode(frame.to_bytes(Sequence::first(), cli.checksum)))
        })
        .collect::<Result<Vec<_>>>()
        .map(|frames| frames.join("\n"))
}

fn do_main() -> Result<String> {
    if std::env::var("GENERATE_COMPLETION").is_ok() {
        generate(Bash, &mut cli::Cli::command(), "cavro-tool", &mut io::stdout());

        return Ok(String::default());
    }

    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if cli.debug {
        "debug"
    } else {
        "info"
    }))
    .format_timestamp(None)
    .format_target(false)
    .init();

    let fmt = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Plain
    };

    if let Commands::Chain {
        steps,
        dry_run: true,
    } = &cli.command
    {
        return cmd_dry_run(&cli, steps);
    }

    let protocol = ProtocolConfig {
        checksum: cli.checksum,
        ..ProtocolConfig::default()
    };
    let transport = port::open_transport(&cli.port, cli.baudrate, cli.force)?;
    let mut bus = Bus::new(transport, protocol);
    for &address in cli.addresses.iter() {
        bus.add_device(device_config(&cli, address));
    }
    let bus = &mut bus;
    let addresses = cli.addresses.as_slice();

    match &cli.command {
        &Commands::Init {
            strength,
            ccw,
            out_port,
        } => {
            let init = Primitive::Initialize {
                direction: if ccw {
                    InitDirection::CounterClockwise
                } else {
                    InitDirection::Clockwise
                },
                force: strength,
                in_port: 0,
                out_port: out_port.unwrap_or(0),
            };
            cmd_action(bus, addresses, cli.wait, fmt, |_, _| Ok(vec![init]))
        }
        &Commands::Move { position } => cmd_action(bus, addresses, cli.wait, fmt, |_, _| {
            Ok(vec![Primitive::MoveAbsolute(position)])
        }),
        &Commands::Pickup { steps, from } => {
            let steps = step_count(steps)?;
            cmd_action(bus, addresses, cli.wait, fmt, |bus, address| {
                relative_move(bus, address, steps, from)
            })
        }
        &Commands::Dispense { steps, to } => {
            let steps = step_count(steps)?;
            cmd_action(bus, addresses, cli.wait, fmt, |bus, address| {
                relative_move(bus, address, -steps, to)
            })
        }
        &Commands::Valve { port, cw, ccw } => {
            let direction = match (cw, ccw) {
                (true, _) => Some(ValveDirection::Clockwise),
                (_, true) => Some(ValveDirection::CounterClockwise),
                _ => None,
            };
            cmd_action(bus, addresses, cli.wait, fmt, |bus, address| {
                if direction.is_none() {
                    sync_position(bus, address)?;
                }
                Ok(vec![Primitive::SelectValve { port, direction }])
            })
        }
        &Commands::Speed {
            code,
            top,
            start,
            cutoff,
            slope,
            microstep,
        } => {
            let steps = code
                .map(Primitive::SetSpeed)
                .into_iter()
                .chain(top.map(Primitive::SetTopSpeed))
                .chain(start.map(Primitive::SetStartSpeed))
                .chain(cutoff.map(Primitive::SetCutoffSpeed))
                .chain(slope.map(Primitive::SetSlope))
                .collect();
            cmd_speed(bus, addresses, steps, microstep, fmt)
        }
        Commands::Status => cmd_status(bus, addresses, fmt),
        Commands::Query { kinds } => cmd_query(bus, addresses, kinds, fmt),
        Commands::Chain { steps, .. } => {
            cmd_action(bus, addresses, cli.wait, fmt, |_, _| Ok(steps.clone()))
        }
        &Commands::Wait { limit, interval } => cmd_wait(
            bus,
            addresses,
            Duration::from_millis(limit),
            Duration::from_millis(interval),
            fmt,
        ),
        Commands::Terminate => {
            cmd_action(bus, addresses, false, fmt, |_, _| Ok(vec![Primitive::Terminate]))
        }
    }
}

fn main() {
    match do_main() {
        Ok(s) => println!("{}", s),
        Err(e) => error!("{:#}", e),
    }
}
