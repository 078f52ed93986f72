//! `sib shell`: line-oriented front end over the FIFO dispatcher
//!
//! ```text
//! list                         search <pattern> [first|all]
//! add <field>...               update <index> <field>...
//! delete <index>               configure <c1;ci1;c2;ci2;c3;ci3>
//! export <clear|encrypted> <file>
//! import <file>                quit
//! ```
//! Commands queue behind each other; results are printed as the
//! dispatcher reports them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sib_core::SearchMode;
use sib_crypto::{CipherSuite, ExportFile};
use sib_protocol::{ClientEvent, Dispatcher, ExportFormat, VaultCommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::Session;

#[derive(Debug)]
enum Line {
    Command(VaultCommand),
    Import(PathBuf),
    Help,
    Quit,
    Empty,
}

pub async fn run(session: Session, search_mode: SearchMode) -> Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::spawn(session, Arc::new(tx));
    let printer = tokio::spawn(print_events(rx));

    println!("connected; type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut closed = false;
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let command = match parse_line(&line, search_mode) {
            Ok(Line::Command(command)) => command,
            Ok(Line::Import(path)) => match read_export(&path) {
                Ok(file) => VaultCommand::Import { file },
                Err(e) => {
                    eprintln!("error: {e:#}");
                    continue;
                }
            },
            Ok(Line::Help) => {
                println!("{}", HELP);
                continue;
            }
            Ok(Line::Quit) => break,
            Ok(Line::Empty) => continue,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };
        if dispatcher.submit(command).is_err() {
            closed = true;
            break;
        }
    }

    if closed {
        dispatcher.disconnect().await;
    } else {
        dispatcher.finish().await;
    }
    printer.await.context("event printer failed")?;
    Ok(())
}

const HELP: &str = "\
list | search <pattern> [first|all] | add <field>... | update <index> <field>...
delete <index> | configure <c1;ci1;c2;ci2;c3;ci3>
export <clear|encrypted> <file> | import <file> | quit";

fn read_export(path: &Path) -> Result<ExportFile> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ExportFile::from_bytes(&data).with_context(|| format!("parsing {}", path.display()))
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<ClientEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ClientEvent::Status(text) => println!("{text}"),
            ClientEvent::Records(records) => {
                if records.is_empty() {
                    println!("no records");
                }
                for record in records {
                    println!("{:>5}  {}", record.index, record.fields.join("  |  "));
                }
            }
            ClientEvent::Exported { destination, file } => {
                match crate::write_export(&destination, &file) {
                    Ok(()) => println!(
                        "exported {} records to {}",
                        file.len(),
                        destination.display()
                    ),
                    Err(e) => eprintln!("error: {e:#}"),
                }
            }
            ClientEvent::Added(index) => println!("added record {index}"),
            ClientEvent::Updated(index) => println!("updated record {index}"),
            ClientEvent::Deleted(index) => println!("deleted record {index}"),
            ClientEvent::Configured(outcome) => println!("cipher suite configured ({outcome:?})"),
            ClientEvent::AccountDeleted => println!("account deleted"),
            ClientEvent::Failed(text) => eprintln!("error: {text}"),
            ClientEvent::Disconnected => {
                println!("disconnected");
                return;
            }
        }
    }
}

fn parse_line(line: &str, search_mode: SearchMode) -> Result<Line> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(Line::Empty);
    };
    let rest: Vec<&str> = words.collect();

    let line = match (verb, rest.as_slice()) {
        ("list", []) => Line::Command(VaultCommand::Export),
        ("search", [pattern]) => Line::Command(VaultCommand::Search {
            pattern: pattern.to_string(),
            mode: search_mode,
        }),
        ("search", [pattern, mode]) => Line::Command(VaultCommand::Search {
            pattern: pattern.to_string(),
            mode: mode.parse()?,
        }),
        ("add", fields) if !fields.is_empty() => Line::Command(VaultCommand::Add {
            values: fields.iter().map(|f| f.to_string()).collect(),
        }),
        ("update", [index, fields @ ..]) if !fields.is_empty() => {
            Line::Command(VaultCommand::Update {
                index: parse_index(index)?,
                values: fields.iter().map(|f| f.to_string()).collect(),
            })
        }
        ("delete", [index]) => Line::Command(VaultCommand::Delete {
            index: parse_index(index)?,
        }),
        ("configure", [names]) => {
            let names: Vec<&str> = names.split(';').collect();
            Line::Command(VaultCommand::Configure {
                suite: CipherSuite::from_names(&names)?,
            })
        }
        ("export", [format, path]) => Line::Command(VaultCommand::ExportFile {
            format: match *format {
                "clear" => ExportFormat::Clear,
                "encrypted" => ExportFormat::Encrypted,
                other => bail!("unknown export format '{other}'"),
            },
            destination: PathBuf::from(*path),
        }),
        ("import", [path]) => Line::Import(PathBuf::from(*path)),
        ("help", []) => Line::Help,
        ("quit" | "exit", []) => Line::Quit,
        _ => bail!("cannot parse '{}'; type 'help'", line.trim()),
    };
    Ok(line)
}

fn parse_index(s: &str) -> Result<u64> {
    s.parse().with_context(|| format!("invalid record index '{s}'"))
}
