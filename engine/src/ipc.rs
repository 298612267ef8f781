//! Unix-socket command surface
//!
//! JSON-lines over a Unix socket, one request per line, one response per
//! line. `subscribe_events` switches the connection into a one-way event
//! stream. Destructive operations run on the blocking pool; the socket
//! task stays responsive for `cancel_operation` from another connection.

use anyhow::Result;
use liboxidisk::units::parse_size;
use liboxidisk::{EngineError, EngineEvent, FsKind, OperationKind, VolumeRole};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{error, info};

use crate::dispatch::Dispatcher;
use crate::ops::image::{BackupArgs, FlashArgs, WindowsInstallArgs};
use crate::ops::partition::TableKind;
use crate::ops;
use crate::preflight::PreflightRequest;
use crate::{scan, sudoers};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum IpcRequest {
    GetDisks { include_system: bool },
    GetPartitionDevices { device: String },
    GetPartitionBounds { partition: String },
    PreflightPartition(PreflightRequest),
    ForceUnmountPartition { partition: String },
    WipeDevice { device: String, table: TableKind, fs: FsKind, label: String, mount: bool },
    CreatePartitionTable { device: String, table: TableKind },
    CreatePartition { device: String, fs: FsKind, label: String, size: String },
    DeletePartition { partition: String },
    FormatPartition { partition: String, fs: FsKind, label: String },
    SetLabelUuid { partition: String, label: Option<String>, uuid: Option<String> },
    CheckPartition { partition: String, repair: bool },
    ResizePartition { partition: String, new_size: String },
    MovePartition { partition: String, new_start: String },
    CopyPartition { source: String, target: String },
    MountVolume { partition: String },
    UnmountVolume { partition: String },
    EjectDisk { device: String },
    ApfsListVolumes { container: String },
    ApfsAddVolume { container: String, name: String, role: VolumeRole },
    ApfsDeleteVolume { volume: String },
    InspectImage { source: PathBuf },
    HashImage { source: PathBuf },
    FlashImage(FlashArgs),
    BackupImage(BackupArgs),
    WindowsInstall(WindowsInstallArgs),
    CancelOperation,
    InstallSudoersHelper,
    RemoveSudoersHelper,
    GetSidecarStatus,
    GetOperationJournal,
    ClearOperationJournal,
    RepairOperationJournal,
    ScanDirectory { path: PathBuf },
    SubscribeEvents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IpcResponse {
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        warnings: Vec<String>,
    },
    Err {
        error: EngineError,
        message: String,
    },
    Event {
        event: EngineEvent,
    },
}

impl IpcResponse {
    fn ok(data: Option<Value>, warnings: Vec<String>) -> Self {
        IpcResponse::Ok { data, warnings }
    }

    fn from_value<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => IpcResponse::Ok {
                data: Some(v),
                warnings: Vec::new(),
            },
            Err(e) => IpcResponse::Err {
                error: EngineError::Io {
                    op: "encoding response".into(),
                    detail: e.to_string(),
                },
                message: e.to_string(),
            },
        }
    }
}

impl From<EngineError> for IpcResponse {
    fn from(error: EngineError) -> Self {
        let message = error.to_string();
        IpcResponse::Err { error, message }
    }
}

pub struct IpcServer {
    socket_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            socket_path,
            dispatcher,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("engine listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, dispatcher).await {
                            error!("client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }
}

async fn handle_client(stream: UnixStream, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let request = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                let response: IpcResponse = EngineError::InvalidInput {
                    field: "request".into(),
                    reason: e.to_string(),
                }
                .into();
                write_json(&mut writer, &response).await?;
                line.clear();
                continue;
            }
        };
        line.clear();

        if matches!(request, IpcRequest::SubscribeEvents) {
            let mut events = dispatcher.bus().subscribe();
            write_json(&mut writer, &IpcResponse::ok(None, Vec::new())).await?;
            // Stream until the client goes away; lagged windows are skipped.
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if write_json(&mut writer, &IpcResponse::Event { event })
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }

        let response = process(request, dispatcher.clone()).await;
        write_json(&mut writer, &response).await?;
    }
    Ok(())
}

async fn write_json<W>(writer: &mut W, response: &IpcResponse) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Execute a blocking engine call off the socket task.
async fn blocking<F>(dispatcher: Arc<Dispatcher>, f: F) -> IpcResponse
where
    F: FnOnce(&Dispatcher) -> Result<IpcResponse, EngineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&dispatcher)).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => error.into(),
        Err(join) => EngineError::Io {
            op: "operation task".into(),
            detail: join.to_string(),
        }
        .into(),
    }
}

fn report_response(
    result: Result<liboxidisk::OpReport, EngineError>,
) -> Result<IpcResponse, EngineError> {
    let report = result?;
    Ok(IpcResponse::ok(report.details, report.warnings))
}

async fn process(request: IpcRequest, dispatcher: Arc<Dispatcher>) -> IpcResponse {
    use IpcRequest::*;

    match request {
        GetDisks { include_system } => {
            blocking(dispatcher, move |d| {
                let devices = d.inspector().list_devices(include_system)?;
                Ok(IpcResponse::from_value(&devices))
            })
            .await
        }
        GetPartitionDevices { device } => {
            blocking(dispatcher, move |d| {
                let partitions = d.inspector().partitions_of(&device)?;
                Ok(IpcResponse::from_value(&partitions))
            })
            .await
        }
        GetPartitionBounds { partition } => {
            blocking(dispatcher, move |d| {
                let bounds = d.inspector().partition_bounds(&partition)?;
                Ok(IpcResponse::from_value(&bounds))
            })
            .await
        }
        PreflightPartition(request) => {
            blocking(dispatcher, move |d| {
                let verdict = d.preflight(&request)?;
                Ok(IpcResponse::from_value(&verdict))
            })
            .await
        }
        ForceUnmountPartition { partition } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_locked(OperationKind::Unmount, &partition, |ctx| {
                    ops::partition::force_unmount_partition(ctx, &partition)
                }))
            })
            .await
        }
        WipeDevice {
            device,
            table,
            fs,
            label,
            mount,
        } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(OperationKind::Wipe, &device, Some(fs), None, |ctx| {
                    ops::partition::wipe_device(ctx, &device, table, fs, &label, mount)
                }))
            })
            .await
        }
        CreatePartitionTable { device, table } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(
                    OperationKind::CreateTable,
                    &device,
                    None,
                    None,
                    |ctx| ops::partition::create_partition_table(ctx, &device, table),
                ))
            })
            .await
        }
        CreatePartition {
            device,
            fs,
            label,
            size,
        } => {
            blocking(dispatcher, move |d| {
                let bytes = parse_size(&size)?;
                report_response(d.execute(
                    OperationKind::Create,
                    &device,
                    Some(fs),
                    Some(bytes),
                    |ctx| ops::partition::create_partition(ctx, &device, fs, &label, &size),
                ))
            })
            .await
        }
        DeletePartition { partition } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(OperationKind::Delete, &partition, None, None, |ctx| {
                    ops::partition::delete_partition(ctx, &partition)
                }))
            })
            .await
        }
        FormatPartition {
            partition,
            fs,
            label,
        } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(
                    OperationKind::Format,
                    &partition,
                    Some(fs),
                    None,
                    |ctx| ops::partition::format_partition(ctx, &partition, fs, &label),
                ))
            })
            .await
        }
        SetLabelUuid {
            partition,
            label,
            uuid,
        } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(
                    OperationKind::LabelUuid,
                    &partition,
                    None,
                    None,
                    |ctx| {
                        ops::partition::set_label_uuid(
                            ctx,
                            &partition,
                            label.as_deref(),
                            uuid.as_deref(),
                        )
                    },
                ))
            })
            .await
        }
        CheckPartition { partition, repair } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_locked(OperationKind::Check, &partition, |ctx| {
                    ops::partition::check_partition(ctx, &partition, repair)
                }))
            })
            .await
        }
        ResizePartition {
            partition,
            new_size,
        } => {
            blocking(dispatcher, move |d| {
                let bytes = parse_size(&new_size)?;
                report_response(d.execute(
                    OperationKind::Resize,
                    &partition,
                    None,
                    Some(bytes),
                    |ctx| ops::resize::resize_partition(ctx, &partition, &new_size),
                ))
            })
            .await
        }
        MovePartition {
            partition,
            new_start,
        } => {
            blocking(dispatcher, move |d| {
                let bytes = parse_size(&new_start)?;
                report_response(d.execute(
                    OperationKind::Move,
                    &partition,
                    None,
                    Some(bytes),
                    |ctx| ops::resize::move_partition(ctx, &partition, &new_start),
                ))
            })
            .await
        }
        CopyPartition { source, target } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(OperationKind::Copy, &target, None, None, |ctx| {
                    ops::resize::copy_partition(ctx, &source, &target)
                }))
            })
            .await
        }
        MountVolume { partition } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_locked(OperationKind::Mount, &partition, |ctx| {
                    ops::partition::mount_partition(ctx, &partition)
                }))
            })
            .await
        }
        UnmountVolume { partition } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_locked(OperationKind::Unmount, &partition, |ctx| {
                    ops::partition::unmount_partition(ctx, &partition)
                }))
            })
            .await
        }
        EjectDisk { device } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_locked(OperationKind::Eject, &device, |ctx| {
                    ops::partition::eject_disk(ctx, &device)
                }))
            })
            .await
        }
        ApfsListVolumes { container } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_readonly(|ctx| {
                    let listing = ops::apfs::list_volumes(ctx, &container)?;
                    Ok(liboxidisk::OpReport::with_details(serde_json::to_value(
                        &listing,
                    )
                    .unwrap_or(Value::Null)))
                }))
            })
            .await
        }
        ApfsAddVolume {
            container,
            name,
            role,
        } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(
                    OperationKind::ApfsAdd,
                    &container,
                    None,
                    None,
                    |ctx| ops::apfs::add_volume(ctx, &container, &name, role),
                ))
            })
            .await
        }
        ApfsDeleteVolume { volume } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute(
                    OperationKind::ApfsDelete,
                    &volume,
                    None,
                    None,
                    |ctx| ops::apfs::delete_volume(ctx, &volume),
                ))
            })
            .await
        }
        InspectImage { source } => {
            blocking(dispatcher, move |_| {
                let inspection = ops::iso::inspect_image(&source)?;
                Ok(IpcResponse::from_value(&inspection))
            })
            .await
        }
        HashImage { source } => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_readonly(|ctx| ops::image::hash_image(ctx, &source)))
            })
            .await
        }
        FlashImage(args) => {
            blocking(dispatcher, move |d| {
                let device = args.device.clone();
                report_response(d.execute(
                    OperationKind::Flash,
                    &device,
                    None,
                    None,
                    |ctx| ops::image::flash_image(ctx, &args),
                ))
            })
            .await
        }
        BackupImage(args) => {
            blocking(dispatcher, move |d| {
                let device = args.device.clone();
                report_response(d.execute(
                    OperationKind::Backup,
                    &device,
                    None,
                    None,
                    |ctx| ops::image::backup_image(ctx, &args),
                ))
            })
            .await
        }
        WindowsInstall(args) => {
            blocking(dispatcher, move |d| {
                let device = args.device.clone();
                report_response(d.execute(
                    OperationKind::WindowsInstall,
                    &device,
                    None,
                    None,
                    |ctx| ops::image::windows_install(ctx, &args),
                ))
            })
            .await
        }
        CancelOperation => {
            dispatcher.cancel();
            IpcResponse::ok(None, Vec::new())
        }
        InstallSudoersHelper => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_readonly(|ctx| {
                    sudoers::install(ctx.registry, ctx.config)
                }))
            })
            .await
        }
        RemoveSudoersHelper => {
            blocking(dispatcher, move |d| {
                report_response(d.execute_readonly(|ctx| sudoers::remove(ctx.config)))
            })
            .await
        }
        GetSidecarStatus => {
            blocking(dispatcher, move |d| {
                Ok(IpcResponse::from_value(&d.sidecar_status()))
            })
            .await
        }
        GetOperationJournal => {
            blocking(dispatcher, move |d| {
                let record = d.journal_record()?;
                Ok(IpcResponse::from_value(&record))
            })
            .await
        }
        ClearOperationJournal => {
            blocking(dispatcher, move |d| report_response(d.clear_journal())).await
        }
        RepairOperationJournal => {
            blocking(dispatcher, move |d| report_response(d.repair_journal())).await
        }
        ScanDirectory { path } => {
            blocking(dispatcher, move |_| {
                let tree = scan::scan_directory(&path)?;
                Ok(IpcResponse::from_value(&tree))
            })
            .await
        }
        SubscribeEvents => IpcResponse::ok(None, Vec::new()),
    }
}

/// Client side, used by `oxidiskctl` and integration tests.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn send(&self, request: &IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let json = serde_json::to_string(request)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Send and fail on engine errors, returning data + warnings.
    pub async fn request(&self, request: &IpcRequest) -> Result<(Option<Value>, Vec<String>)> {
        match self.send(request).await? {
            IpcResponse::Ok { data, warnings } => Ok((data, warnings)),
            IpcResponse::Err { message, .. } => Err(anyhow::anyhow!(message)),
            IpcResponse::Event { .. } => Err(anyhow::anyhow!("unexpected event frame")),
        }
    }

    /// Subscribe and hand every event to `on_event` until the stream ends.
    pub async fn watch<F>(&self, mut on_event: F) -> Result<()>
    where
        F: FnMut(EngineEvent),
    {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let json = serde_json::to_string(&IpcRequest::SubscribeEvents)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        while reader.read_line(&mut line).await? > 0 {
            if let Ok(IpcResponse::Event { event }) = serde_json::from_str(&line) {
                on_event(event);
            }
            line.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = IpcRequest::FormatPartition {
            partition: "sda3".into(),
            fs: FsKind::Exfat,
            label: "OXI".into(),
        };
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(v["command"], "format_partition");
        assert_eq!(v["args"]["fs"], "exfat");

        let back: IpcRequest = serde_json::from_value(v).unwrap();
        assert!(matches!(back, IpcRequest::FormatPartition { .. }));
    }

    #[test]
    fn test_error_response_shape() {
        let response: IpcResponse = EngineError::PreflightRequired.into();
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["status"], "err");
        assert_eq!(v["error"]["kind"], "preflight_required");
        assert!(v["message"].as_str().unwrap().contains("preflight"));
    }

    #[test]
    fn test_event_frame_round_trip() {
        let response = IpcResponse::Event {
            event: EngineEvent::Log(liboxidisk::LogEvent {
                source: "sfdisk".into(),
                line: "done".into(),
            }),
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: IpcResponse = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, IpcResponse::Event { .. }));
    }
}
