//! A scripted stand-in for a school portal: one HTTP request per connection,
//! answered by a routing closure, plus the report hub's WebSocket.
#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use netschool::config::{ClientConfig, Credentials};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::{
    Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Recorded {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: String,
}

impl Reply {
    pub fn json(body: Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json; charset=utf-8",
            headers: vec![],
            body: body.to_string(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            headers: vec![],
            body: body.to_string(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            headers: vec![],
            body: String::new(),
        }
    }

    pub fn cookie(mut self, line: &str) -> Self {
        self.headers.push(("Set-Cookie", line.to_string()));
        self
    }
}

/// What the report hub does once the client has sent `StartTask`.
#[derive(Debug, Clone)]
pub enum HubScript {
    Complete(String),
    Fail(String),
    Silent,
    /// Drops the TCP stream without a closing handshake.
    Hangup,
    /// Closes with this code before any result.
    Close(u16),
}

type Router = Arc<dyn Fn(&Recorded) -> Reply + Send + Sync>;

pub struct PortalStub {
    pub host: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    hub_frames: Arc<Mutex<Vec<String>>>,
    hub_closes: Arc<Mutex<Vec<u16>>>,
    handle: JoinHandle<()>,
}

impl PortalStub {
    pub async fn start(
        router: impl Fn(&Recorded) -> Reply + Send + Sync + 'static,
        hub: HubScript,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let host = listener
            .local_addr()
            .expect("resolved local listener address")
            .to_string();
        let router: Router = Arc::new(router);
        let requests = Arc::new(Mutex::new(vec![]));
        let hub_frames = Arc::new(Mutex::new(vec![]));
        let hub_closes = Arc::new(Mutex::new(vec![]));

        let handle = tokio::spawn({
            let requests = Arc::clone(&requests);
            let hub_frames = Arc::clone(&hub_frames);
            let hub_closes = Arc::clone(&hub_closes);
            async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    let router = Arc::clone(&router);
                    let requests = Arc::clone(&requests);
                    let hub_frames = Arc::clone(&hub_frames);
                    let hub_closes = Arc::clone(&hub_closes);
                    let hub = hub.clone();
                    tokio::spawn(async move {
                        if is_hub_connect(&socket).await {
                            serve_hub(socket, hub, hub_frames, hub_closes).await;
                        } else {
                            serve_http(socket, router, requests).await;
                        }
                    });
                }
            }
        });

        Self {
            host,
            requests,
            hub_frames,
            hub_closes,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn find(&self, path: &str) -> Option<Recorded> {
        self.requests().into_iter().find(|request| request.path() == path)
    }

    pub fn hub_frames(&self) -> Vec<String> {
        self.hub_frames.lock().unwrap().clone()
    }

    /// Close codes the hub received, waiting a little for them to arrive.
    pub async fn hub_closes(&self) -> Vec<u16> {
        for _ in 0..50 {
            let closes = self.hub_closes.lock().unwrap().clone();
            if !closes.is_empty() {
                return closes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        vec![]
    }

    /// Waits for a request the client sends without awaiting it.
    pub async fn wait_for(&self, path: &str) -> Option<Recorded> {
        for _ in 0..50 {
            if let Some(request) = self.find(path) {
                return Some(request);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

impl Drop for PortalStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        login: "ivanov".into(),
        password: "abc".into(),
        selector: "CID=2&SID=1&PID=-1&CN=3&SFT=2&SCID=23".into(),
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        req_per_sec: 1000,
        min_gap: Duration::from_millis(1),
        ..ClientConfig::default()
    }
}

pub const SETTINGS_PAGE: &str = r#"
    <table>
      <tr><td>Фамилия</td><td><input type="text" value="Иванов"></td></tr>
      <tr><td>Имя</td><td><input type="text" value="Пётр"></td></tr>
      <tr><td>E-Mail</td><td><input type="text" value="petr@example.ru"></td></tr>
    </table>
    <script>
      var appContext = { yearId: 2041, schoolId: 89, currYear: '2023/2024', dateFormat: 'dd.mm.yy', serverTimeZone: 3 };
      appContext.fullSchoolName = 'МБОУ СОШ №5';
    </script>
"#;

pub fn report_filters() -> Value {
    json!({
        "filterSources": [
            {"filterId": "SID", "defaultValue": "7"},
            {"filterId": "PCLID_IUP", "defaultValue": "42_0"},
            {"filterId": "SGID", "items": [
                {"title": "Алгебра", "value": "101"},
                {"title": "Физика", "value": "102"}
            ]},
            {"filterId": "period", "minValue": "2023-09-01T00:00:00", "maxValue": "2024-05-31T00:00:00"}
        ]
    })
}

/// Answers the whole login and context bootstrap; `fallback` handles the rest.
pub fn portal_router(
    fallback: impl Fn(&Recorded) -> Option<Reply> + Send + Sync + 'static,
) -> impl Fn(&Recorded) -> Reply + Send + Sync + 'static {
    move |request| {
        if let Some(reply) = fallback(request) {
            return reply;
        }
        match (request.method.as_str(), request.path()) {
            ("GET", "/") => Reply::html("<html></html>").cookie("NSSESSIONID=s1; path=/"),
            ("POST", "/webapi/auth/getdata") => {
                Reply::json(json!({"lt": 4242, "ver": 900, "salt": "s"})).cookie("ESRNSec=e1; path=/")
            }
            ("POST", "/webapi/login") => Reply::json(json!({"at": "AT1", "timeOut": 2_700_000})),
            ("POST", "/asp/MySettings/MySettings.asp") => Reply::html(SETTINGS_PAGE),
            ("GET", "/webapi/reports/studentgrades") => Reply::json(report_filters()),
            ("POST", "/asp/logout.asp") => Reply::html("bye"),
            ("GET", "/webapi/prepareloginform") => Reply::json(json!({"cid": 2})),
            _ => Reply::status(404),
        }
    }
}

async fn is_hub_connect(socket: &TcpStream) -> bool {
    let mut buffer = [0_u8; 512];
    for _ in 0..50 {
        let Ok(n) = socket.peek(&mut buffer).await else {
            return false;
        };
        let seen = &buffer[..n];
        if n == 0 {
            return false;
        }
        if seen.windows(2).any(|window| window == b"\r\n") || n == buffer.len() {
            return String::from_utf8_lossy(seen).contains("/WebApi/signalr/connect");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn serve_hub(
    socket: TcpStream,
    script: HubScript,
    frames: Arc<Mutex<Vec<String>>>,
    closes: Arc<Mutex<Vec<u16>>>,
) {
    let Ok(mut hub) = tokio_tungstenite::accept_async(socket).await else {
        return;
    };
    while let Some(Ok(message)) = hub.next().await {
        match message {
            Message::Text(text) => {
                frames.lock().unwrap().push(text.to_string());
                let reply = match &script {
                    HubScript::Complete(data) => json!({"M": [{"H": "queuehub", "M": "complete", "A": [{"Data": data}]}]}),
                    HubScript::Fail(details) => json!({"M": [{"H": "queuehub", "M": "error", "A": [{"Details": details}]}]}),
                    HubScript::Silent => continue,
                    HubScript::Hangup => return,
                    HubScript::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(*code),
                            reason: "queue gone".into(),
                        };
                        let _ = hub.close(Some(frame)).await;
                        return;
                    }
                };
                // Noise first; it must not move the job.
                let _ = hub.send(Message::Text("{}".into())).await;
                let _ = hub.send(Message::Text(reply.to_string().into())).await;
            }
            Message::Close(frame) => {
                let code = frame.map(|frame| u16::from(frame.code)).unwrap_or(1005);
                closes.lock().unwrap().push(code);
                break;
            }
            _ => {}
        }
    }
}

async fn serve_http(mut socket: TcpStream, router: Router, requests: Arc<Mutex<Vec<Recorded>>>) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    requests.lock().unwrap().push(request.clone());
    let reply = router(&request);

    let mut head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.content_type,
        reply.body.len()
    );
    for (name, value) in &reply.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(reply.body.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> Option<Recorded> {
    let mut raw = Vec::new();
    let mut buffer = [0_u8; 2048];
    let header_end = loop {
        let n = socket.read(&mut buffer).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buffer[..n]);
        if let Some(index) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
            break index + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim().to_string()))
        .collect();

    let length: usize = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .and_then(|(_, value)| value.parse().ok())
        .unwrap_or(0);
    let mut body = raw[header_end..].to_vec();
    while body.len() < length {
        let n = socket.read(&mut buffer).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buffer[..n]);
    }

    Some(Recorded {
        method,
        target,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}
