//! Local-socket transport.
//!
//! Every channel carries newline-delimited JSON: one request line, one reply
//! line. Clients keep one connection per peer and reconnect lazily on the next
//! call after a failure; a failed round trip is never retried.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use interprocess::local_socket::{LocalSocketListener, LocalSocketStream};
use nalgebra::Vector3;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::action::{ActionResult, ExecutorCommand, ExecutorReply};
use crate::controller::CollaborationController;
use crate::devices::{
    ActionExecutor, CartesianPoseSource, GazeContext, GazeController, GazeSettings,
    ReactiveController,
};
use crate::error::{CollaborationError, Result};
use crate::geometry::{Arm, Pose3};
use crate::monitor::seconds;

type Connection = BufReader<LocalSocketStream>;

/// Request/response client for one named peer.
#[derive(Clone)]
pub struct RpcChannel {
    peer: String,
    name: String,
    connection: Arc<Mutex<Option<Connection>>>,
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("peer", &self.peer)
            .field("name", &self.name)
            .finish()
    }
}

impl RpcChannel {
    /// Does not connect; the first call does.
    pub fn new(peer: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            name: name.into(),
            connection: Arc::new(Mutex::new(None)),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends `request` and decodes the single reply line.
    pub async fn call<Req, Rep>(&self, request: &Req) -> Result<Rep>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        debug!(peer = %self.peer, request = line.trim_end(), "rpc request");

        let connection = self.connection.clone();
        let name = self.name.clone();
        let reply = tokio::task::spawn_blocking(move || round_trip(&connection, &name, &line))
            .await
            .map_err(|e| CollaborationError::communication(&self.peer, e))?
            .map_err(|e| CollaborationError::communication(&self.peer, e))?;

        debug!(peer = %self.peer, reply = reply.trim_end(), "rpc reply");
        Ok(serde_json::from_str(&reply)?)
    }
}

/// A round trip abandoned by its caller keeps the connection until the peer
/// answers or hangs up; calls made meanwhile fail instead of queueing behind it.
fn round_trip(slot: &Mutex<Option<Connection>>, name: &str, line: &str) -> io::Result<String> {
    let mut guard = match slot.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::WouldBlock) => {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "previous request still awaiting a reply",
            ))
        }
        Err(TryLockError::Poisoned(_)) => {
            return Err(io::Error::new(io::ErrorKind::Other, "connection lock poisoned"))
        }
    };
    if guard.is_none() {
        *guard = Some(BufReader::new(LocalSocketStream::connect(name)?));
    }
    let connection = guard
        .as_mut()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection"))?;

    let result = exchange(connection, line);
    if result.is_err() {
        *guard = None;
    }
    result
}

fn exchange(connection: &mut Connection, line: &str) -> io::Result<String> {
    connection.get_mut().write_all(line.as_bytes())?;
    connection.get_mut().flush()?;
    let mut reply = String::new();
    if connection.read_line(&mut reply)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ));
    }
    Ok(reply)
}

/// Boolean acknowledgement used by the reactive and gaze controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ReactRequest {
    SetXd { target: Vector3<f64> },
    Stop,
}

pub struct IpcReactiveController {
    channel: RpcChannel,
}

impl IpcReactiveController {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            channel: RpcChannel::new("reactive controller", name),
        }
    }
}

#[async_trait]
impl ReactiveController for IpcReactiveController {
    async fn set_target(&self, position: &Vector3<f64>) -> Result<bool> {
        let ack: Ack = self
            .channel
            .call(&ReactRequest::SetXd { target: *position })
            .await?;
        Ok(ack.ok)
    }

    async fn stop(&self) -> Result<bool> {
        let ack: Ack = self.channel.call(&ReactRequest::Stop).await?;
        Ok(ack.ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CartesianRequest {
    GetPose,
}

pub struct IpcCartesianPoseSource {
    channel: RpcChannel,
}

impl IpcCartesianPoseSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            channel: RpcChannel::new("cartesian controller", name),
        }
    }
}

#[async_trait]
impl CartesianPoseSource for IpcCartesianPoseSource {
    async fn current_pose(&self) -> Result<Pose3> {
        self.channel.call(&CartesianRequest::GetPose).await
    }
}

pub struct IpcActionExecutor {
    channel: RpcChannel,
}

impl IpcActionExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            channel: RpcChannel::new("action executor", name),
        }
    }
}

#[async_trait]
impl ActionExecutor for IpcActionExecutor {
    async fn execute(&self, command: &ExecutorCommand) -> Result<ExecutorReply> {
        self.channel.call(command).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GazeRequest {
    StoreContext,
    RestoreContext { context: GazeContext },
    Configure { settings: GazeSettings },
    LookAtAbsAngles { angles: Vector3<f64> },
    WaitMotionDone { period: f64, timeout: f64 },
    GetAngles,
    StopControl,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ContextReply {
    context: GazeContext,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct AnglesReply {
    angles: Vector3<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct DoneReply {
    done: bool,
}

pub struct IpcGazeController {
    channel: RpcChannel,
}

impl IpcGazeController {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            channel: RpcChannel::new("gaze controller", name),
        }
    }

    async fn acked(&self, request: &GazeRequest, command: &str) -> Result<()> {
        let ack: Ack = self.channel.call(request).await?;
        if ack.ok {
            Ok(())
        } else {
            Err(CollaborationError::Rejected {
                peer: self.channel.peer().to_string(),
                command: command.to_string(),
            })
        }
    }
}

#[async_trait]
impl GazeController for IpcGazeController {
    async fn store_context(&self) -> Result<GazeContext> {
        let reply: ContextReply = self.channel.call(&GazeRequest::StoreContext).await?;
        Ok(reply.context)
    }

    async fn restore_context(&self, context: GazeContext) -> Result<()> {
        self.acked(&GazeRequest::RestoreContext { context }, "restore_context")
            .await
    }

    async fn configure(&self, settings: &GazeSettings) -> Result<()> {
        self.acked(&GazeRequest::Configure { settings: *settings }, "configure")
            .await
    }

    async fn look_at_angles(&self, angles: &Vector3<f64>) -> Result<()> {
        self.acked(&GazeRequest::LookAtAbsAngles { angles: *angles }, "look_at_abs_angles")
            .await
    }

    async fn wait_motion_done(&self, poll: Duration, timeout: Duration) -> Result<bool> {
        let request = GazeRequest::WaitMotionDone {
            period: poll.as_secs_f64(),
            timeout: timeout.as_secs_f64(),
        };
        let reply: DoneReply = self.channel.call(&request).await?;
        Ok(reply.done)
    }

    async fn angles(&self) -> Result<Vector3<f64>> {
        let reply: AnglesReply = self.channel.call(&GazeRequest::GetAngles).await?;
        Ok(reply.angles)
    }

    async fn stop_control(&self) -> Result<()> {
        self.acked(&GazeRequest::StopControl, "stop_control").await
    }
}

/// Commands accepted by the [`CommandServer`]. Missing arms default to the
/// controlled arm and missing timeouts to the configured default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CollaborationCommand {
    Home,
    Reach {
        target: String,
        #[serde(default)]
        arm: Option<Arm>,
        #[serde(default)]
        timeout: Option<f64>,
    },
    ReachPose {
        position: [f64; 3],
        #[serde(default)]
        arm: Option<Arm>,
        #[serde(default)]
        timeout: Option<f64>,
    },
    ReachHome {
        #[serde(default)]
        arm: Option<Arm>,
        #[serde(default)]
        timeout: Option<f64>,
    },
    Take {
        target: String,
        #[serde(default)]
        arm: Option<Arm>,
    },
    TakePose {
        position: [f64; 3],
        #[serde(default)]
        arm: Option<Arm>,
    },
    Grasp {
        target: String,
        #[serde(default)]
        arm: Option<Arm>,
    },
    GraspPose {
        position: [f64; 3],
        #[serde(default)]
        arm: Option<Arm>,
    },
    Give {
        part: String,
        #[serde(default)]
        arm: Option<Arm>,
    },
    GivePose {
        position: [f64; 3],
        #[serde(default)]
        arm: Option<Arm>,
    },
    Drop {
        position: [f64; 3],
        #[serde(default)]
        arm: Option<Arm>,
    },
    DropInBasket {
        #[serde(default)]
        arm: Option<Arm>,
    },
    /// `arm` stays a raw string so unknown sides reach the gate and fail closed.
    CheckReachable { position: [f64; 3], arm: String },
    LookAtHome {
        #[serde(default)]
        timeout: Option<f64>,
    },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    fn from_action(outcome: Result<ActionResult>) -> Self {
        match outcome {
            Ok(result) => Self {
                ok: result.is_acknowledged(),
                result: Some(result),
                error: None,
            },
            Err(e) => Self::failure(e),
        }
    }

    fn flag(ok: bool) -> Self {
        Self {
            ok,
            result: None,
            error: None,
        }
    }

    fn failure(e: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(e.to_string()),
        }
    }
}

fn pose([x, y, z]: [f64; 3]) -> Pose3 {
    Pose3::new(x, y, z)
}

/// Runs one command to completion against `controller`.
pub async fn handle_command(
    controller: &CollaborationController,
    command: CollaborationCommand,
) -> CommandReply {
    let arm = |arm: Option<Arm>| arm.unwrap_or_else(|| controller.arm());
    let timeout =
        |t: Option<f64>| t.and_then(seconds).unwrap_or_else(|| controller.default_timeout());

    use CollaborationCommand as C;
    match command {
        C::Home => CommandReply::from_action(controller.home().await),
        C::Reach { target, arm: a, timeout: t } => CommandReply::from_action(
            controller.reach_entity(&target, arm(a), timeout(t)).await,
        ),
        C::ReachPose { position, arm: a, timeout: t } => CommandReply::from_action(
            controller.reach_pose(pose(position), arm(a), timeout(t)).await,
        ),
        C::ReachHome { arm: a, timeout: t } => {
            CommandReply::from_action(controller.reach_home(arm(a), timeout(t)).await)
        }
        C::Take { target, arm: a } => {
            CommandReply::from_action(controller.take_entity(&target, arm(a)).await)
        }
        C::TakePose { position, arm: a } => {
            CommandReply::from_action(controller.take_pose(pose(position), arm(a)).await)
        }
        C::Grasp { target, arm: a } => {
            CommandReply::from_action(controller.grasp_entity(&target, arm(a)).await)
        }
        C::GraspPose { position, arm: a } => {
            CommandReply::from_action(controller.grasp_pose(pose(position), arm(a)).await)
        }
        C::Give { part, arm: a } => {
            CommandReply::from_action(controller.give_to_partner(&part, arm(a)).await)
        }
        C::GivePose { position, arm: a } => {
            CommandReply::from_action(controller.give_pose(pose(position), arm(a)).await)
        }
        C::Drop { position, arm: a } => {
            CommandReply::from_action(controller.drop_pose(pose(position), arm(a)).await)
        }
        C::DropInBasket { arm: a } => {
            CommandReply::from_action(controller.drop_in_basket(arm(a)).await)
        }
        C::CheckReachable { position, arm: side } => {
            CommandReply::flag(controller.check_reachable(&pose(position), &side))
        }
        C::LookAtHome { timeout: t } => {
            let t = t
                .and_then(seconds)
                .unwrap_or_else(|| controller.gaze_home_timeout());
            match controller.look_at_home(t).await {
                Ok(done) => CommandReply::flag(done),
                Err(e) => CommandReply::failure(e),
            }
        }
        C::Stop => CommandReply::from_action(Ok(controller.stop_reaching().await)),
    }
}

/// Inbound command surface of the controller.
///
/// Connections are served one at a time and each command runs to completion
/// before the next line is read.
pub struct CommandServer {
    listener: Option<LocalSocketListener>,
    name: String,
}

impl std::fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServer")
            .field("name", &self.name)
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        let _ = self.listener.take();

        // Only the instance that bound the socket path unlinks it.
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.name);
        }
    }
}

impl CommandServer {
    pub fn bind(name: &str) -> Result<Self> {
        // A prior run may have left the socket path behind.
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(name);
        }

        let listener = LocalSocketListener::bind(name).map_err(|e| {
            CollaborationError::communication(format!("command socket {name}"), e)
        })?;
        info!(name, "command server bound");
        Ok(Self {
            listener: Some(listener),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts the accept loop on a dedicated thread. Commands are executed on
    /// `runtime`. Can only be called once.
    pub fn spawn(
        &mut self,
        controller: Arc<CollaborationController>,
        runtime: Handle,
    ) -> Result<JoinHandle<()>> {
        let listener = self.listener.take().ok_or_else(|| {
            CollaborationError::Config("command server already started".to_string())
        })?;

        let handle = std::thread::Builder::new()
            .name("collaboration-rpc".to_string())
            .spawn(move || {
                for incoming in listener.incoming() {
                    match incoming {
                        Ok(stream) => {
                            if let Err(e) = serve_connection(stream, &controller, &runtime) {
                                warn!(error = %e, "command connection ended");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to accept command connection"),
                    }
                }
            })?;
        Ok(handle)
    }
}

fn serve_connection(
    stream: LocalSocketStream,
    controller: &CollaborationController,
    runtime: &Handle,
) -> io::Result<()> {
    let mut connection = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        if connection.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<CollaborationCommand>(request) {
            Ok(command) => {
                debug!(?command, "command received");
                runtime.block_on(handle_command(controller, command))
            }
            Err(e) => CommandReply::failure(format!("malformed command: {e}")),
        };

        let mut out = serde_json::to_string(&reply)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.push('\n');
        connection.get_mut().write_all(out.as_bytes())?;
        connection.get_mut().flush()?;
    }
}
