//! oxidiskctl - engine control and debugging utility

mod battery;
mod bus;
mod config;
mod dispatch;
mod inspect;
mod ipc;
mod journal;
mod ops;
mod preflight;
mod scan;
mod sidecar;
mod sudoers;
#[cfg(test)]
mod testutil;

use anyhow::Result;
use clap::{Parser, Subcommand};
use liboxidisk::{EngineEvent, FsKind, VolumeRole};
use std::path::PathBuf;

use crate::ipc::{IpcClient, IpcRequest};
use crate::ops::image::{BackupArgs, FlashArgs, WindowsInstallArgs};
use crate::ops::partition::TableKind;
use crate::preflight::PreflightRequest;

/// Control the Oxidisk engine daemon
#[derive(Parser)]
#[command(name = "oxidiskctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Socket path
    #[arg(long, default_value = "/run/oxidisk/engine.sock")]
    socket: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices and their partitions
    List {
        /// Include system-protected devices
        #[arg(long)]
        all: bool,
    },

    /// Show the legal move range for a partition
    Bounds { partition: String },

    /// Run the preflight safety checks for an operation
    Preflight {
        operation: String,
        target: String,
        #[arg(long)]
        fs: Option<String>,
        #[arg(long)]
        size: Option<String>,
    },

    /// Sidecar binary status
    Sidecars,

    /// Operation journal management
    Journal {
        #[command(subcommand)]
        command: JournalCommands,
    },

    /// Wipe a device: fresh table, one spanning partition
    Wipe {
        device: String,
        #[arg(long, default_value = "gpt")]
        table: String,
        #[arg(long, default_value = "exfat")]
        fs: String,
        #[arg(long, default_value = "")]
        label: String,
    },

    /// Create a partition in the largest free gap
    Create {
        device: String,
        fs: String,
        label: String,
        size: String,
    },

    /// Delete a partition
    Delete { partition: String },

    /// Format a partition
    Format {
        partition: String,
        fs: String,
        #[arg(default_value = "")]
        label: String,
    },

    /// Check (and optionally repair) a filesystem
    Check {
        partition: String,
        #[arg(long)]
        repair: bool,
    },

    /// Resize a partition
    Resize { partition: String, size: String },

    /// Move a partition to a new start offset
    Move { partition: String, start: String },

    /// Byte-copy one partition onto another
    Copy { source: String, target: String },

    /// Mount, unmount, eject
    Mount { partition: String },
    Unmount {
        partition: String,
        /// Terminate busy processes first
        #[arg(long)]
        force: bool,
    },
    Eject { device: String },

    /// Container volume management
    Apfs {
        #[command(subcommand)]
        command: ApfsCommands,
    },

    /// Classify an image file
    Inspect { image: PathBuf },

    /// SHA-256 of an image file
    Hash { image: PathBuf },

    /// Flash an image onto a device
    Flash {
        image: PathBuf,
        device: String,
        #[arg(long)]
        verify: bool,
        #[arg(long)]
        allow_windows: bool,
    },

    /// Back a device up into an image file
    Backup {
        device: String,
        target: PathBuf,
        #[arg(long)]
        compress: bool,
        #[arg(long)]
        overwrite: bool,
    },

    /// Stage a Windows installer onto a device
    WindowsInstall {
        image: PathBuf,
        device: String,
        #[arg(long, default_value = "WININSTALL")]
        label: String,
        #[arg(long)]
        tpm_bypass: bool,
        #[arg(long)]
        local_account: bool,
        #[arg(long)]
        privacy_defaults: bool,
    },

    /// Cancel the active operation
    Cancel,

    /// Install or remove the sudoers fragment
    Sudoers {
        #[command(subcommand)]
        command: SudoersCommands,
    },

    /// Aggregate directory sizes
    Scan { path: PathBuf },

    /// Stream progress and log events
    Watch,
}

#[derive(Subcommand)]
enum JournalCommands {
    /// Show the interrupted-operation record, if any
    Show,
    /// Drop the record without touching the device
    Clear,
    /// Resume or repair, then clear
    Repair,
}

#[derive(Subcommand)]
enum ApfsCommands {
    /// List volumes of a container
    List { container: String },
    /// Add a volume
    Add {
        container: String,
        name: String,
        #[arg(long, default_value = "data")]
        role: String,
    },
    /// Delete a volume
    Delete { volume: String },
}

#[derive(Subcommand)]
enum SudoersCommands {
    Install,
    Remove,
}

fn parse_fs(s: &str) -> Result<FsKind> {
    s.parse::<FsKind>().map_err(|e| anyhow::anyhow!("{}", e))
}

fn parse_table(s: &str) -> Result<TableKind> {
    match s {
        "gpt" => Ok(TableKind::Gpt),
        "mbr" | "dos" => Ok(TableKind::Mbr),
        other => Err(anyhow::anyhow!("unknown table scheme: {}", other)),
    }
}

async fn run_and_print(client: &IpcClient, request: IpcRequest) -> Result<()> {
    let (data, warnings) = client.request(&request).await?;
    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }
    if let Some(data) = data {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("ok");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = IpcClient::new(&cli.socket);

    match cli.command {
        Commands::List { all } => {
            let (data, _) = client
                .request(&IpcRequest::GetDisks {
                    include_system: all,
                })
                .await?;
            let devices: Vec<liboxidisk::Device> =
                serde_json::from_value(data.unwrap_or_default())?;
            for device in devices {
                println!(
                    "{:<12} {:>14} bytes  {}{}",
                    device.identifier,
                    device.size,
                    device.model.as_deref().unwrap_or("-"),
                    device
                        .protection
                        .map(|r| format!("  [protected: {}]", r))
                        .unwrap_or_default()
                );
                for part in &device.partitions {
                    println!(
                        "  {:<10} {:>14} bytes  {:<8} {}",
                        part.identifier,
                        part.size,
                        part.fs_type.map(|f| f.to_string()).unwrap_or_default(),
                        part.mount_point
                            .as_ref()
                            .map(|m| m.display().to_string())
                            .unwrap_or_default()
                    );
                }
                for gap in &device.unallocated {
                    println!("  {:<10} {:>14} bytes  (free)", gap.key, gap.size);
                }
            }
            Ok(())
        }

        Commands::Bounds { partition } => {
            run_and_print(&client, IpcRequest::GetPartitionBounds { partition }).await
        }

        Commands::Preflight {
            operation,
            target,
            fs,
            size,
        } => {
            let request = PreflightRequest {
                operation: serde_json::from_value(serde_json::Value::String(operation))?,
                target,
                fs: fs.as_deref().map(parse_fs).transpose()?,
                new_size: size
                    .as_deref()
                    .map(liboxidisk::units::parse_size)
                    .transpose()?,
            };
            run_and_print(&client, IpcRequest::PreflightPartition(request)).await
        }

        Commands::Sidecars => run_and_print(&client, IpcRequest::GetSidecarStatus).await,

        Commands::Journal { command } => match command {
            JournalCommands::Show => {
                run_and_print(&client, IpcRequest::GetOperationJournal).await
            }
            JournalCommands::Clear => {
                run_and_print(&client, IpcRequest::ClearOperationJournal).await
            }
            JournalCommands::Repair => {
                run_and_print(&client, IpcRequest::RepairOperationJournal).await
            }
        },

        Commands::Wipe {
            device,
            table,
            fs,
            label,
        } => {
            run_and_print(
                &client,
                IpcRequest::WipeDevice {
                    device,
                    table: parse_table(&table)?,
                    fs: parse_fs(&fs)?,
                    label,
                    mount: true,
                },
            )
            .await
        }

        Commands::Create {
            device,
            fs,
            label,
            size,
        } => {
            run_and_print(
                &client,
                IpcRequest::CreatePartition {
                    device,
                    fs: parse_fs(&fs)?,
                    label,
                    size,
                },
            )
            .await
        }

        Commands::Delete { partition } => {
            run_and_print(&client, IpcRequest::DeletePartition { partition }).await
        }

        Commands::Format {
            partition,
            fs,
            label,
        } => {
            run_and_print(
                &client,
                IpcRequest::FormatPartition {
                    partition,
                    fs: parse_fs(&fs)?,
                    label,
                },
            )
            .await
        }

        Commands::Check { partition, repair } => {
            run_and_print(&client, IpcRequest::CheckPartition { partition, repair }).await
        }

        Commands::Resize { partition, size } => {
            run_and_print(
                &client,
                IpcRequest::ResizePartition {
                    partition,
                    new_size: size,
                },
            )
            .await
        }

        Commands::Move { partition, start } => {
            run_and_print(
                &client,
                IpcRequest::MovePartition {
                    partition,
                    new_start: start,
                },
            )
            .await
        }

        Commands::Copy { source, target } => {
            run_and_print(&client, IpcRequest::CopyPartition { source, target }).await
        }

        Commands::Mount { partition } => {
            run_and_print(&client, IpcRequest::MountVolume { partition }).await
        }

        Commands::Unmount { partition, force } => {
            let request = if force {
                IpcRequest::ForceUnmountPartition { partition }
            } else {
                IpcRequest::UnmountVolume { partition }
            };
            run_and_print(&client, request).await
        }

        Commands::Eject { device } => {
            run_and_print(&client, IpcRequest::EjectDisk { device }).await
        }

        Commands::Apfs { command } => match command {
            ApfsCommands::List { container } => {
                run_and_print(&client, IpcRequest::ApfsListVolumes { container }).await
            }
            ApfsCommands::Add {
                container,
                name,
                role,
            } => {
                run_and_print(
                    &client,
                    IpcRequest::ApfsAddVolume {
                        container,
                        name,
                        role: VolumeRole::parse(&role),
                    },
                )
                .await
            }
            ApfsCommands::Delete { volume } => {
                run_and_print(&client, IpcRequest::ApfsDeleteVolume { volume }).await
            }
        },

        Commands::Inspect { image } => {
            run_and_print(&client, IpcRequest::InspectImage { source: image }).await
        }

        Commands::Hash { image } => {
            run_and_print(&client, IpcRequest::HashImage { source: image }).await
        }

        Commands::Flash {
            image,
            device,
            verify,
            allow_windows,
        } => {
            run_and_print(
                &client,
                IpcRequest::FlashImage(FlashArgs {
                    source: image,
                    device,
                    verify,
                    allow_windows,
                }),
            )
            .await
        }

        Commands::Backup {
            device,
            target,
            compress,
            overwrite,
        } => {
            run_and_print(
                &client,
                IpcRequest::BackupImage(BackupArgs {
                    device,
                    target,
                    compress,
                    overwrite,
                }),
            )
            .await
        }

        Commands::WindowsInstall {
            image,
            device,
            label,
            tpm_bypass,
            local_account,
            privacy_defaults,
        } => {
            run_and_print(
                &client,
                IpcRequest::WindowsInstall(WindowsInstallArgs {
                    source: image,
                    device,
                    label,
                    tpm_bypass,
                    local_account,
                    privacy_defaults,
                    layout: None,
                }),
            )
            .await
        }

        Commands::Cancel => run_and_print(&client, IpcRequest::CancelOperation).await,

        Commands::Sudoers { command } => match command {
            SudoersCommands::Install => {
                run_and_print(&client, IpcRequest::InstallSudoersHelper).await
            }
            SudoersCommands::Remove => {
                run_and_print(&client, IpcRequest::RemoveSudoersHelper).await
            }
        },

        Commands::Scan { path } => {
            run_and_print(&client, IpcRequest::ScanDirectory { path }).await
        }

        Commands::Watch => {
            client
                .watch(|event| match event {
                    EngineEvent::Progress(p) => {
                        let bytes = p
                            .bytes
                            .map(|b| format!("  {} bytes", b))
                            .unwrap_or_default();
                        println!(
                            "{:>3}%  {}{}",
                            p.percent,
                            p.message.unwrap_or_default(),
                            bytes
                        );
                    }
                    EngineEvent::Log(l) => println!("[{}] {}", l.source, l.line),
                })
                .await
        }
    }
}
