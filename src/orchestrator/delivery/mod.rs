use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::orchestrator::triggers::TriggerAction;

pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TCP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_UDP_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_OSC_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_OSC_PATH: &str = "/trigger";
const HTTP_ERROR_BODY_LIMIT: usize = 4_096;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
    Osc,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Osc => "osc",
        }
    }
}

/// Where the actions of one network application are sent.
///
/// `address` (`host:port`) is used by tcp, udp and osc; `url`, `method` and
/// `headers` by http. A zero `timeout_ms` selects the protocol default.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TargetConfig {
    pub protocol: Protocol,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub timeout_ms: u64,
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        let default_ms = match self.protocol {
            Protocol::Http => DEFAULT_HTTP_TIMEOUT_MS,
            Protocol::Tcp => DEFAULT_TCP_TIMEOUT_MS,
            Protocol::Udp => DEFAULT_UDP_TIMEOUT_MS,
            Protocol::Osc => DEFAULT_OSC_TIMEOUT_MS,
        };
        let timeout_ms = if self.timeout_ms == 0 {
            default_ms
        } else {
            self.timeout_ms
        };
        Duration::from_millis(timeout_ms)
    }

    fn http_method(&self) -> Result<Method, String> {
        let method = self.method.trim();
        if method.is_empty() {
            return Ok(Method::POST);
        }
        Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| format!("invalid http method '{method}'"))
    }

    fn osc_path(&self) -> &str {
        if self.path.is_empty() {
            DEFAULT_OSC_PATH
        } else {
            &self.path
        }
    }

    /// Checks the fields the protocol needs; the message names what is wrong.
    pub fn validate(&self) -> Result<(), String> {
        match self.protocol {
            Protocol::Http => {
                if self.url.trim().is_empty() {
                    return Err("http target requires 'url'".to_owned());
                }
                self.http_method().map(|_| ())
            }
            Protocol::Tcp | Protocol::Udp | Protocol::Osc => {
                if self.address.trim().is_empty() {
                    return Err(format!(
                        "{} target requires 'address' as host:port",
                        self.protocol.as_str()
                    ));
                }
                if self.protocol == Protocol::Osc && !self.osc_path().starts_with('/') {
                    return Err(format!("osc path '{}' must start with '/'", self.path));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug)]
pub enum DeliveryError {
    NoTarget { app_id: String },
    MismatchedApp { target: String, action: String },
    Encode(serde_json::Error),
    Resolve { address: String, source: io::Error },
    Io { address: String, source: io::Error },
    HttpClient(reqwest::Error),
    Http { url: String, source: reqwest::Error },
    HttpStatus { url: String, status: u16, body: String },
    InvalidTarget { app_id: String, message: String },
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTarget { app_id } => write!(f, "no target configured for app '{app_id}'"),
            Self::MismatchedApp { target, action } => write!(
                f,
                "action for app '{action}' cannot be sent to the target of '{target}'"
            ),
            Self::Encode(source) => write!(f, "failed to encode action payload: {source}"),
            Self::Resolve { address, source } => {
                write!(f, "failed to resolve '{address}': {source}")
            }
            Self::Io { address, source } => write!(f, "send to '{address}' failed: {source}"),
            Self::HttpClient(source) => write!(f, "failed to build http client: {source}"),
            Self::Http { url, source } => write!(f, "http request to '{url}' failed: {source}"),
            Self::HttpStatus { url, status, body } => {
                write!(f, "http request to '{url}' returned {status}: {body}")
            }
            Self::InvalidTarget { app_id, message } => {
                write!(f, "invalid target for app '{app_id}': {message}")
            }
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Sends routed network actions to the target configured for their app.
pub struct Router {
    targets: BTreeMap<String, TargetConfig>,
    http: Option<Client>,
}

impl Router {
    pub fn new(targets: BTreeMap<String, TargetConfig>) -> Result<Self, DeliveryError> {
        let needs_http = targets
            .values()
            .any(|target| target.protocol == Protocol::Http);
        let http = if needs_http {
            Some(Client::builder().build().map_err(DeliveryError::HttpClient)?)
        } else {
            None
        };
        Ok(Self { targets, http })
    }

    pub fn target(&self, app_id: &str) -> Option<&TargetConfig> {
        self.targets.get(app_id)
    }

    /// Delivers every action of one trigger bound for `app_id` as one message.
    pub fn send_actions(
        &self,
        app_id: &str,
        trigger: &str,
        actions: &[&TriggerAction],
    ) -> Result<Protocol, DeliveryError> {
        let target = self.target(app_id).ok_or_else(|| DeliveryError::NoTarget {
            app_id: app_id.to_owned(),
        })?;
        if let Some(stray) = actions.iter().find(|action| action.app_id != app_id) {
            return Err(DeliveryError::MismatchedApp {
                target: app_id.to_owned(),
                action: stray.app_id.clone(),
            });
        }

        let payload = action_list_payload(trigger, actions).map_err(DeliveryError::Encode)?;
        match target.protocol {
            Protocol::Http => self.send_http(app_id, target, payload)?,
            Protocol::Tcp => send_tcp(target, &payload)?,
            Protocol::Udp => send_udp(target, &payload)?,
            Protocol::Osc => {
                let text = String::from_utf8_lossy(&payload);
                send_udp(target, &encode_osc_message(target.osc_path(), &text))?
            }
        }
        Ok(target.protocol)
    }

    fn send_http(
        &self,
        app_id: &str,
        target: &TargetConfig,
        payload: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let invalid = |message: String| DeliveryError::InvalidTarget {
            app_id: app_id.to_owned(),
            message,
        };
        let client = self
            .http
            .as_ref()
            .ok_or_else(|| invalid("http client was not initialized".to_owned()))?;
        let method = target.http_method().map_err(invalid)?;

        let mut request = client
            .request(method, &target.url)
            .header(CONTENT_TYPE, "application/json")
            .timeout(target.timeout())
            .body(payload);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().map_err(|source| DeliveryError::Http {
            url: target.url.clone(),
            source,
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().unwrap_or_default();
        if body.len() > HTTP_ERROR_BODY_LIMIT {
            let mut cut = HTTP_ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(DeliveryError::HttpStatus {
            url: target.url.clone(),
            status: status.as_u16(),
            body: body.trim().to_owned(),
        })
    }
}

/// JSON body shared by every protocol: the trigger name and its actions.
pub fn action_list_payload(
    trigger: &str,
    actions: &[&TriggerAction],
) -> Result<Vec<u8>, serde_json::Error> {
    let actions: Vec<_> = actions
        .iter()
        .map(|action| {
            json!({
                "appId": action.app_id,
                "actionType": action.action_type,
                "args": action.args,
            })
        })
        .collect();
    serde_json::to_vec(&json!({ "trigger": trigger, "actions": actions }))
}

/// OSC 1.0 message with a single string argument.
pub fn encode_osc_message(path: &str, argument: &str) -> Vec<u8> {
    let mut packet = Vec::new();
    push_osc_string(&mut packet, path);
    push_osc_string(&mut packet, ",s");
    push_osc_string(&mut packet, argument);
    packet
}

fn push_osc_string(packet: &mut Vec<u8>, value: &str) {
    packet.extend_from_slice(value.as_bytes());
    packet.push(0);
    while packet.len() % 4 != 0 {
        packet.push(0);
    }
}

fn resolve(address: &str) -> Result<SocketAddr, DeliveryError> {
    let resolve_error = |source| DeliveryError::Resolve {
        address: address.to_owned(),
        source,
    };
    address
        .to_socket_addrs()
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

fn send_tcp(target: &TargetConfig, payload: &[u8]) -> Result<(), DeliveryError> {
    let address = resolve(&target.address)?;
    let io_error = |source| DeliveryError::Io {
        address: target.address.clone(),
        source,
    };

    let mut stream = TcpStream::connect_timeout(&address, target.timeout()).map_err(io_error)?;
    stream
        .set_write_timeout(Some(target.timeout()))
        .map_err(io_error)?;
    stream.write_all(payload).map_err(io_error)?;
    stream.flush().map_err(io_error)
}

fn send_udp(target: &TargetConfig, payload: &[u8]) -> Result<(), DeliveryError> {
    let address = resolve(&target.address)?;
    let io_error = |source| DeliveryError::Io {
        address: target.address.clone(),
        source,
    };

    let local: SocketAddr = if address.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0_u16; 8], 0))
    };
    let socket = UdpSocket::bind(local).map_err(io_error)?;
    socket
        .set_write_timeout(Some(target.timeout()))
        .map_err(io_error)?;
    socket.send_to(payload, address).map_err(io_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{Read, Write};
    use std::net::{TcpListener, UdpSocket};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use serde_json::{json, Value};

    use crate::orchestrator::triggers::TriggerAction;

    use super::{
        action_list_payload, encode_osc_message, DeliveryError, Protocol, Router, TargetConfig,
    };

    fn target(protocol: Protocol) -> TargetConfig {
        TargetConfig {
            protocol,
            address: String::new(),
            url: String::new(),
            method: String::new(),
            headers: BTreeMap::new(),
            path: String::new(),
            timeout_ms: 1_000,
        }
    }

    fn action(app_id: &str) -> TriggerAction {
        TriggerAction {
            app_id: app_id.to_owned(),
            action_type: "SendRequest".to_owned(),
            args: BTreeMap::from([("path".to_owned(), "/cue".to_owned())]),
        }
    }

    fn router(app_id: &str, target: TargetConfig) -> Router {
        Router::new(BTreeMap::from([(app_id.to_owned(), target)])).expect("router should build")
    }

    /// Answers one HTTP request with `status` and hands back the request body.
    fn serve_one_http_request(listener: TcpListener, status: &'static str) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("client should connect");
            let mut request = Vec::new();
            let mut chunk = [0_u8; 1024];
            let body_start = loop {
                let read = stream.read(&mut chunk).expect("request should arrive");
                request.extend_from_slice(&chunk[..read]);
                if let Some(end) = request.windows(4).position(|window| window == b"\r\n\r\n") {
                    break end + 4;
                }
            };
            let head = String::from_utf8_lossy(&request[..body_start]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while request.len() < body_start + content_length {
                let read = stream.read(&mut chunk).expect("body should arrive");
                request.extend_from_slice(&chunk[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: 4\r\nconnection: close\r\n\r\nnope"
            );
            stream
                .write_all(response.as_bytes())
                .expect("response should be written");
            let _ = sender.send(String::from_utf8_lossy(&request[body_start..]).to_string());
        });
        receiver
    }

    #[test]
    fn payload_lists_trigger_and_actions() {
        let first = action("TcpEndpoint");
        let payload = action_list_payload("drop", &[&first]).expect("payload encodes");
        let decoded: Value = serde_json::from_slice(&payload).expect("payload is json");

        assert_eq!(
            decoded,
            json!({
                "trigger": "drop",
                "actions": [{
                    "appId": "TcpEndpoint",
                    "actionType": "SendRequest",
                    "args": {"path": "/cue"}
                }]
            })
        );
    }

    #[test]
    fn osc_strings_are_null_terminated_and_padded() {
        let packet = encode_osc_message("/cue", "ab");

        assert_eq!(&packet[..8], b"/cue\0\0\0\0");
        assert_eq!(&packet[8..12], b",s\0\0");
        assert_eq!(&packet[12..], b"ab\0\0");
        assert_eq!(packet.len() % 4, 0);
    }

    #[test]
    fn validates_protocol_specific_fields() {
        assert!(target(Protocol::Tcp).validate().is_err());
        assert!(target(Protocol::Http).validate().is_err());

        let mut http = target(Protocol::Http);
        http.url = "http://127.0.0.1:1/hook".to_owned();
        assert!(http.validate().is_ok());
        http.method = "not a method".to_owned();
        assert!(http.validate().is_err());

        let mut osc = target(Protocol::Osc);
        osc.address = "127.0.0.1:9000".to_owned();
        osc.path = "cue".to_owned();
        assert!(osc.validate().is_err());
    }

    #[test]
    fn default_timeouts_apply_when_unset() {
        let mut tcp = target(Protocol::Tcp);
        tcp.timeout_ms = 0;
        assert_eq!(tcp.timeout(), Duration::from_millis(5_000));

        let mut osc = target(Protocol::Osc);
        osc.timeout_ms = 0;
        assert_eq!(osc.timeout(), Duration::from_millis(3_000));
    }

    #[test]
    fn sends_actions_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener binds");
        let mut tcp = target(Protocol::Tcp);
        tcp.address = listener.local_addr().expect("local addr").to_string();
        let receiver = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("client should connect");
            let mut received = Vec::new();
            stream.read_to_end(&mut received).expect("payload should arrive");
            received
        });

        let first = action("TcpEndpoint");
        let protocol = router("TcpEndpoint", tcp)
            .send_actions("TcpEndpoint", "drop", &[&first])
            .expect("tcp delivery succeeds");

        let received: Value =
            serde_json::from_slice(&receiver.join().expect("receiver thread")).expect("json");
        assert_eq!(protocol, Protocol::Tcp);
        assert_eq!(received["actions"][0]["appId"], "TcpEndpoint");
    }

    #[test]
    fn sends_actions_over_udp_and_osc() {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("socket binds");
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout");
        let address = socket.local_addr().expect("local addr").to_string();
        let mut buffer = [0_u8; 2048];

        let mut udp = target(Protocol::Udp);
        udp.address = address.clone();
        let first = action("UdpEndpoint");
        router("UdpEndpoint", udp)
            .send_actions("UdpEndpoint", "drop", &[&first])
            .expect("udp delivery succeeds");
        let (size, _) = socket.recv_from(&mut buffer).expect("datagram arrives");
        let received: Value = serde_json::from_slice(&buffer[..size]).expect("json");
        assert_eq!(received["trigger"], "drop");

        let mut osc = target(Protocol::Osc);
        osc.address = address;
        let cue = action("OscEndpoint");
        router("OscEndpoint", osc)
            .send_actions("OscEndpoint", "drop", &[&cue])
            .expect("osc delivery succeeds");
        let (size, _) = socket.recv_from(&mut buffer).expect("osc packet arrives");
        assert!(buffer[..size].starts_with(b"/trigger\0\0\0\0,s\0\0{"));
    }

    #[test]
    fn posts_actions_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener binds");
        let mut http = target(Protocol::Http);
        http.url = format!("http://{}/hook", listener.local_addr().expect("local addr"));
        http.headers = BTreeMap::from([("x-show".to_owned(), "main".to_owned())]);
        let bodies = serve_one_http_request(listener, "202 Accepted");

        let first = action("HttpEndpoint");
        router("HttpEndpoint", http)
            .send_actions("HttpEndpoint", "drop", &[&first])
            .expect("http delivery succeeds");

        let body: Value = serde_json::from_str(
            &bodies
                .recv_timeout(Duration::from_secs(2))
                .expect("server saw the request"),
        )
        .expect("json body");
        assert_eq!(body["actions"][0]["actionType"], "SendRequest");
    }

    #[test]
    fn http_error_status_is_reported_with_body() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener binds");
        let mut http = target(Protocol::Http);
        http.url = format!("http://{}/hook", listener.local_addr().expect("local addr"));
        let _bodies = serve_one_http_request(listener, "500 Internal Server Error");

        let first = action("HttpEndpoint");
        let error = router("HttpEndpoint", http)
            .send_actions("HttpEndpoint", "drop", &[&first])
            .expect_err("server rejects the request");

        assert!(matches!(
            error,
            DeliveryError::HttpStatus { status: 500, ref body, .. } if body == "nope"
        ));
    }

    #[test]
    fn rejects_unknown_app_and_mismatched_actions() {
        let mut tcp = target(Protocol::Tcp);
        tcp.address = "127.0.0.1:9".to_owned();
        let router = router("TcpEndpoint", tcp);
        let stray = action("UdpEndpoint");

        assert!(matches!(
            router.send_actions("UdpEndpoint", "drop", &[&stray]),
            Err(DeliveryError::NoTarget { .. })
        ));
        assert!(matches!(
            router.send_actions("TcpEndpoint", "drop", &[&stray]),
            Err(DeliveryError::MismatchedApp { .. })
        ));
    }
}
