use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

use crate::{
    error::{PortalError, ProtocolFailure},
    requests::{RequestGateway, RequestOptions},
    text_manipulators::{encode_uri_component, value_to_string},
};

pub const CLOSE_COMPLETE: u16 = 4000;
pub const CLOSE_INIT_FAILED: u16 = 4001;
pub const CLOSE_CHANNEL_ERROR: u16 = 4002;
pub const CLOSE_TASK_ERROR: u16 = 4003;
pub const CLOSE_FORCED: u16 = 4009;

const HUB: &str = "queuehub";
const CLIENT_PROTOCOL: &str = "1.5";
// [{"name":"queuehub"}]
const CONNECTION_DATA: &str = "%5B%7B%22name%22%3A%22queuehub%22%7D%5D";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Init,
    Negotiating,
    Connecting,
    Starting,
    Running,
    Complete(String),
    Failed(ProtocolFailure),
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failed(_) | Self::Aborted)
    }
}

/// Things that happen to a job once its channel exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The start call, queue request or `StartTask` send failed.
    StartFailed(String),
    Message(String),
    ChannelError(String),
    Closed { code: Option<u16>, reason: String },
    DeadlineElapsed,
}

/// What the driver has to do after feeding an event in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Close the channel with this code.
    pub close_code: Option<u16>,
    /// The job just became terminal; send the abort call.
    pub finalize: bool,
}

impl Transition {
    const NONE: Self = Self {
        close_code: None,
        finalize: false,
    };

    fn terminal(close_code: Option<u16>) -> Self {
        Self {
            close_code,
            finalize: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HubFrame {
    #[serde(rename = "M", default)]
    messages: Vec<HubMessage>,
}

#[derive(Debug, Deserialize)]
struct HubMessage {
    #[serde(rename = "M", default)]
    method: String,
    #[serde(rename = "A", default)]
    args: Vec<Value>,
}

/// `{"I":0,"H":"queuehub","M":"StartTask","A":[taskId]}`
#[derive(Debug, Serialize)]
pub struct StartTask<'a> {
    #[serde(rename = "I")]
    pub sequence: u32,
    #[serde(rename = "H")]
    pub hub: &'a str,
    #[serde(rename = "M")]
    pub method: &'a str,
    #[serde(rename = "A")]
    pub args: [&'a Value; 1],
}

impl<'a> StartTask<'a> {
    pub fn new(task_id: &'a Value) -> Self {
        Self {
            sequence: 0,
            hub: HUB,
            method: "StartTask",
            args: [task_id],
        }
    }
}

/// One report job. Reaches exactly one of `Complete`, `Failed` or `Aborted`;
/// every event after that is ignored.
#[derive(Debug)]
pub struct ReportJob {
    pub connection_token: Option<String>,
    pub task_id: Option<Value>,
    state: JobState,
}

impl Default for ReportJob {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportJob {
    pub fn new() -> Self {
        Self {
            connection_token: None,
            task_id: None,
            state: JobState::Init,
        }
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves along the non-terminal steps. Ignored once terminal.
    pub fn advance(&mut self, next: JobState) {
        if self.is_terminal() || next.is_terminal() {
            return;
        }
        debug!("report job {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Failure before a channel could be used (negotiate or connect).
    pub fn fail(&mut self, failure: ProtocolFailure) -> Transition {
        if self.is_terminal() {
            return Transition::NONE;
        }
        self.state = JobState::Failed(failure);
        Transition::terminal(None)
    }

    pub fn handle(&mut self, event: ChannelEvent) -> Transition {
        if self.is_terminal() {
            return Transition::NONE;
        }
        match event {
            ChannelEvent::StartFailed(message) => {
                debug!("report job failed to start: {message}");
                self.state = JobState::Failed(ProtocolFailure::Initialization);
                Transition::terminal(Some(CLOSE_INIT_FAILED))
            }
            ChannelEvent::Message(text) => self.handle_message(&text),
            ChannelEvent::ChannelError(message) => {
                self.state = JobState::Failed(ProtocolFailure::Channel(message));
                Transition::terminal(Some(CLOSE_CHANNEL_ERROR))
            }
            ChannelEvent::Closed { code, reason } => {
                self.state = match ProtocolFailure::from_close_code(code, &reason) {
                    Some(ProtocolFailure::Aborted) => JobState::Aborted,
                    Some(failure) => JobState::Failed(failure),
                    // A clean close code without a result is still a close we
                    // did not ask for.
                    None => JobState::Failed(ProtocolFailure::Unknown(reason)),
                };
                Transition::terminal(None)
            }
            ChannelEvent::DeadlineElapsed => {
                self.state = JobState::Aborted;
                Transition::terminal(Some(CLOSE_FORCED))
            }
        }
    }

    fn handle_message(&mut self, text: &str) -> Transition {
        let Ok(frame) = serde_json::from_str::<HubFrame>(text) else {
            return Transition::NONE;
        };
        let Some(message) = frame.messages.first() else {
            return Transition::NONE;
        };
        let first_arg = message.args.first();
        match message.method.as_str() {
            "complete" => {
                let data = first_arg
                    .and_then(|arg| arg.get("Data"))
                    .map(value_to_string)
                    .unwrap_or_default();
                self.state = JobState::Complete(data);
                Transition::terminal(Some(CLOSE_COMPLETE))
            }
            "error" => {
                let details = first_arg
                    .and_then(|arg| arg.get("Details"))
                    .map(value_to_string)
                    .unwrap_or_default();
                self.state = JobState::Failed(ProtocolFailure::Task(details));
                Transition::terminal(Some(CLOSE_TASK_ERROR))
            }
            _ => Transition::NONE,
        }
    }

    /// The file id on completion, the failure otherwise.
    pub fn into_result(self) -> Result<String, ProtocolFailure> {
        match self.state {
            JobState::Complete(data) => Ok(data),
            JobState::Failed(failure) => Err(failure),
            JobState::Aborted => Err(ProtocolFailure::Aborted),
            state => Err(ProtocolFailure::Unknown(format!(
                "job stopped in state {state:?}"
            ))),
        }
    }
}

/// Everything a job needs from the session that owns it.
pub struct JobContext<'a> {
    pub gateway: &'a RequestGateway,
    pub auth_token: &'a str,
    pub version: &'a str,
    /// The four fixed params every queue request carries.
    pub params: Value,
    pub deadline: Option<Duration>,
}

/// A queued report: endpoint plus filter selection.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub queue_path: &'static str,
    pub selected_data: Value,
}

#[derive(Debug, Deserialize)]
struct Negotiated {
    #[serde(rename = "ConnectionToken")]
    connection_token: String,
}

#[derive(Debug, Deserialize)]
struct Queued {
    #[serde(rename = "taskId")]
    task_id: Value,
}

type Channel = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn signalr_query(auth_token: &str, connection_token: &str) -> String {
    format!(
        "at={auth_token}&clientProtocol={CLIENT_PROTOCOL}&transport=webSockets&connectionData={CONNECTION_DATA}&connectionToken={}",
        encode_uri_component(connection_token)
    )
}

/// Runs one report job to its end and returns the generated file's text.
pub async fn run(ctx: &JobContext<'_>, request: &ReportRequest) -> Result<String, PortalError> {
    let mut job = ReportJob::new();
    drive(ctx, request, &mut job).await?;

    let file_id = job.into_result()?;
    info!("report job for {} complete, file {file_id}", request.queue_path);
    let response = ctx
        .gateway
        .request(
            &format!("/webapi/files/{file_id}"),
            RequestOptions::get().header("at", ctx.auth_token),
        )
        .await?;
    Ok(response.text())
}

async fn drive(
    ctx: &JobContext<'_>,
    request: &ReportRequest,
    job: &mut ReportJob,
) -> Result<(), PortalError> {
    job.advance(JobState::Negotiating);
    let negotiated: Negotiated = ctx
        .gateway
        .request(
            &format!(
                "/WebApi/signalr/negotiate?_={}&at={}&clientProtocol={CLIENT_PROTOCOL}&transport=webSockets&connectionData={CONNECTION_DATA}",
                ctx.version, ctx.auth_token
            ),
            RequestOptions::get(),
        )
        .await?
        .json_as()?;
    job.connection_token = Some(negotiated.connection_token.clone());
    let query = signalr_query(ctx.auth_token, &negotiated.connection_token);

    job.advance(JobState::Connecting);
    let mut channel = match connect(ctx.gateway, &query).await {
        Ok(channel) => channel,
        Err(message) => {
            let transition = job.fail(ProtocolFailure::Channel(message));
            finalize(ctx, job, transition);
            return Ok(());
        }
    };

    job.advance(JobState::Starting);
    let started = start_task(ctx, request, &query, job).await;
    let transition = match started {
        Ok(()) => {
            job.advance(JobState::Running);
            Transition::NONE
        }
        Err(error) => job.handle(ChannelEvent::StartFailed(error.to_string())),
    };
    settle(ctx, &mut channel, job, transition).await;

    if job.is_terminal() {
        return Ok(());
    }
    let task_id = job.task_id.clone().unwrap_or(Value::Null);
    let sent = match serde_json::to_string(&StartTask::new(&task_id)) {
        Ok(frame) => channel
            .send(Message::Text(frame))
            .await
            .map_err(|error| error.to_string()),
        Err(error) => Err(error.to_string()),
    };
    if let Err(message) = sent {
        let transition = job.handle(ChannelEvent::StartFailed(message));
        settle(ctx, &mut channel, job, transition).await;
        return Ok(());
    }

    let deadline = ctx.deadline.map(|limit| Instant::now() + limit);
    while !job.is_terminal() {
        let event = match next_event(&mut channel, deadline).await {
            Some(event) => event,
            None => continue,
        };
        let transition = job.handle(event);
        settle(ctx, &mut channel, job, transition).await;
    }
    Ok(())
}

/// TLS settings for a `wss://` channel, matching the HTTP client's.
fn tls_connector(gateway: &RequestGateway) -> Result<Option<Connector>, String> {
    if !gateway.is_secure() {
        return Ok(None);
    }
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(gateway.accept_invalid_certs())
        .build()
        .map_err(|error| error.to_string())?;
    Ok(Some(Connector::NativeTls(connector)))
}

async fn connect(gateway: &RequestGateway, query: &str) -> Result<Channel, String> {
    let url = format!("{}/WebApi/signalr/connect?{query}", gateway.ws_base_url());
    let mut request = url.into_client_request().map_err(|error| error.to_string())?;
    let headers = gateway.base_headers().map_err(|error| error.to_string())?;
    for (name, value) in &headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }
    let connector = tls_connector(gateway)?;
    let (channel, _) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(|error| error.to_string())?;
    debug!("report channel open");
    Ok(channel)
}

async fn start_task(
    ctx: &JobContext<'_>,
    request: &ReportRequest,
    query: &str,
    job: &mut ReportJob,
) -> Result<(), PortalError> {
    ctx.gateway
        .request(&format!("/WebApi/signalr/start?{query}"), RequestOptions::get())
        .await?
        .json()?;

    let body = json!({
        "selectedData": request.selected_data,
        "params": ctx.params,
    });
    let queued: Queued = ctx
        .gateway
        .request(
            request.queue_path,
            RequestOptions::post()
                .json_body(body)
                .header("at", ctx.auth_token),
        )
        .await?
        .json_as()?;
    job.task_id = Some(queued.task_id);
    Ok(())
}

/// `None` for frames that carry nothing for the job (pings, binary).
async fn next_event(channel: &mut Channel, deadline: Option<Instant>) -> Option<ChannelEvent> {
    let next = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, channel.next()).await {
            Ok(next) => next,
            Err(_) => return Some(ChannelEvent::DeadlineElapsed),
        },
        None => channel.next().await,
    };
    match next {
        Some(Ok(Message::Text(text))) => Some(ChannelEvent::Message(text)),
        Some(Ok(Message::Close(frame))) => Some(ChannelEvent::Closed {
            code: frame.as_ref().map(|frame| u16::from(frame.code)),
            reason: frame
                .map(|frame| frame.reason.to_string())
                .unwrap_or_default(),
        }),
        Some(Ok(_)) => None,
        Some(Err(error)) => Some(ChannelEvent::ChannelError(error.to_string())),
        None => Some(ChannelEvent::Closed {
            code: None,
            reason: "channel ended".to_string(),
        }),
    }
}

/// Carries out a transition: closes the channel when asked to and, once the
/// job is over, tells the hub to let go of it.
async fn settle(
    ctx: &JobContext<'_>,
    channel: &mut Channel,
    job: &ReportJob,
    transition: Transition,
) {
    if let Some(code) = transition.close_code {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(error) = channel.close(Some(frame)).await {
            debug!("closing report channel with {code}: {error}");
        }
    }
    finalize(ctx, job, transition);
}

fn finalize(ctx: &JobContext<'_>, job: &ReportJob, transition: Transition) {
    if !transition.finalize {
        return;
    }
    if let Some(token) = &job.connection_token {
        spawn_abort(ctx.gateway.clone(), ctx.auth_token.to_string(), token.clone());
    }
}

/// Tells the hub to drop the connection. Nobody waits for the answer.
fn spawn_abort(gateway: RequestGateway, auth_token: String, connection_token: String) {
    tokio::spawn(async move {
        let path = format!(
            "/WebApi/signalr/abort?{}",
            signalr_query(&auth_token, &connection_token)
        );
        if let Err(error) = gateway.request(&path, RequestOptions::get()).await {
            warn!("report channel abort failed: {error}");
        }
    });
}
