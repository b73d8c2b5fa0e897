use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RelayError, Result};
use crate::transport::CredentialValidator;

/// Credential schemes a protocol handler may use to answer a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Basic,
    Digest,
}

/// One entry of a publishIps / readIps list: a single address or a CIDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Net(IpAddr, u8),
}

impl IpRange {
    pub fn parse(text: &str) -> std::result::Result<Self, String> {
        match text.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr
                    .parse()
                    .map_err(|_| format!("invalid address '{}'", text))?;
                let len: u8 = len
                    .parse()
                    .map_err(|_| format!("invalid prefix length '{}'", text))?;
                let max = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                if len > max {
                    return Err(format!("invalid prefix length '{}'", text));
                }
                Ok(IpRange::Net(addr, len))
            }
            None => {
                let addr: IpAddr = text
                    .parse()
                    .map_err(|_| format!("invalid address '{}'", text))?;
                Ok(IpRange::Single(addr))
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match *self {
            IpRange::Single(addr) => addr == ip,
            IpRange::Net(net, prefix) => match (net, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u32::MAX << (32 - u32::from(prefix))
                    };
                    (u32::from(net) & mask) == (u32::from(ip) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - u32::from(prefix))
                    };
                    (u128::from(net) & mask) == (u128::from(ip) & mask)
                }
                _ => false,
            },
        }
    }
}

pub fn ip_equal_or_in_range(ip: IpAddr, ranges: &[IpRange]) -> bool {
    ranges.iter().any(|range| range.contains(ip))
}

/// IP list check followed by the caller-supplied credential check.
/// The validator's error is propagated unchanged.
pub fn authenticate(
    ip: IpAddr,
    validate_credentials: Option<CredentialValidator>,
    methods: &[AuthMethod],
    allowed_ips: &[IpRange],
    user: &Option<String>,
    pass: &Option<String>,
) -> Result<()> {
    if !allowed_ips.is_empty() && !ip_equal_or_in_range(ip, allowed_ips) {
        return Err(RelayError::auth_critical(format!(
            "IP '{}' not allowed",
            ip
        )));
    }

    if let (Some(user), Some(validate)) = (user, validate_credentials) {
        validate(methods, user, pass.as_deref().unwrap_or(""))?;
    }

    Ok(())
}

/// Body POSTed to the external authorization endpoint.
#[derive(Debug, Serialize)]
pub struct PlayRequestPayload {
    pub remote_addr: String,
    pub local_addr: String,
    pub path: String,
}

/// What the endpoint decided for one play request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
    /// Serve the request from this upstream instead of the configured one.
    Redirect(String),
}

/// Consults the external endpoint. One fresh connection per call;
/// redirects are a signal, never followed.
pub async fn request_play_decision(
    callback_url: &str,
    payload: &PlayRequestPayload,
    timeout: Duration,
) -> Result<AuthDecision> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(|err| RelayError::Upstream(err.to_string()))?;

    let resp = client
        .post(callback_url)
        .json(payload)
        .send()
        .await
        .map_err(|err| RelayError::Upstream(err.to_string()))?;

    let status = resp.status().as_u16();
    match status {
        200..=299 => Ok(AuthDecision::Allow),
        300..=399 => {
            let target = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty());
            match target {
                Some(target) => Ok(AuthDecision::Redirect(target.to_string())),
                None => Err(RelayError::Upstream(
                    "invalid location header in redirect response".to_string(),
                )),
            }
        }
        400..=499 => Ok(AuthDecision::Deny),
        _ => Err(RelayError::Upstream(format!(
            "invalid response status {}",
            status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn test_ip_range_parse() {
        assert_eq!(
            IpRange::parse("192.168.1.5").unwrap(),
            IpRange::Single("192.168.1.5".parse().unwrap())
        );
        assert_eq!(
            IpRange::parse("10.0.0.0/8").unwrap(),
            IpRange::Net("10.0.0.0".parse().unwrap(), 8)
        );
        assert!(IpRange::parse("10.0.0.0/33").is_err());
        assert!(IpRange::parse("not-an-ip").is_err());
        assert!(IpRange::parse("fd00::/8").is_ok());
    }

    #[test]
    fn test_ip_range_contains() {
        let net = IpRange::parse("10.0.0.0/8").unwrap();
        assert!(net.contains("10.1.2.3".parse().unwrap()));
        assert!(!net.contains("192.168.1.5".parse().unwrap()));

        let single = IpRange::parse("192.168.1.5").unwrap();
        assert!(single.contains("192.168.1.5".parse().unwrap()));
        assert!(!single.contains("192.168.1.6".parse().unwrap()));

        let v6 = IpRange::parse("fd00::/8").unwrap();
        assert!(v6.contains("fd00::1".parse().unwrap()));
        assert!(!v6.contains("10.0.0.1".parse().unwrap()));

        let all = IpRange::parse("0.0.0.0/0").unwrap();
        assert!(all.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_authenticate_ip_rejection() {
        let ranges = vec![IpRange::parse("10.0.0.0/8").unwrap()];
        let err = authenticate(
            "192.168.1.5".parse().unwrap(),
            None,
            &[AuthMethod::Basic],
            &ranges,
            &None,
            &None,
        )
        .unwrap_err();
        assert_eq!(err.wire_status(), Some(401));
    }

    #[test]
    fn test_authenticate_credentials() {
        let validator: CredentialValidator = Box::new(|methods, user, pass| {
            assert_eq!(methods, &[AuthMethod::Basic][..]);
            if user == "admin" && pass == "secret" {
                Ok(())
            } else {
                Err(RelayError::auth_critical("wrong credentials"))
            }
        });

        authenticate(
            "10.0.0.1".parse().unwrap(),
            Some(validator),
            &[AuthMethod::Basic],
            &[],
            &Some("admin".to_string()),
            &Some("secret".to_string()),
        )
        .unwrap();

        let rejecting: CredentialValidator =
            Box::new(|_, _, _| Err(RelayError::auth_critical("wrong credentials")));
        let err = authenticate(
            "10.0.0.1".parse().unwrap(),
            Some(rejecting),
            &[AuthMethod::Basic],
            &[],
            &Some("admin".to_string()),
            &Some("secret".to_string()),
        )
        .unwrap_err();
        assert_eq!(err.wire_status(), Some(401));
    }

    #[test]
    fn test_authenticate_no_user_skips_validator() {
        // the validator must not run when the path has no user configured
        let validator: CredentialValidator =
            Box::new(|_, _, _| panic!("validator should not be called"));
        authenticate(
            "10.0.0.1".parse().unwrap(),
            Some(validator),
            &[AuthMethod::Basic],
            &[],
            &None,
            &None,
        )
        .unwrap();
    }

    fn body_length(request: &[u8]) -> Option<(usize, usize)> {
        let text = String::from_utf8_lossy(request);
        let header_end = text.find("\r\n\r\n")? + 4;
        let length = text
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        Some((header_end, length))
    }

    /// Accepts one connection, captures the full request, answers with a
    /// canned response.
    async fn serve_once(response: &'static str) -> (SocketAddr, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match body_length(&request) {
                    Some((header_end, length)) if request.len() >= header_end + length => break,
                    _ => {}
                }
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
            sock.write_all(response.as_bytes()).await.unwrap();
        });
        (addr, rx)
    }

    fn payload() -> PlayRequestPayload {
        PlayRequestPayload {
            remote_addr: "192.168.1.5:42101".to_string(),
            local_addr: "10.0.0.2:8554".to_string(),
            path: "cam1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_decision_allow() {
        let (addr, request) =
            serve_once("HTTP/1.1 204 No Content\r\ncontent-length: 0\r\n\r\n").await;
        let decision = request_play_decision(
            &format!("http://{}/auth", addr),
            &payload(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(decision, AuthDecision::Allow);

        let request = request.await.unwrap();
        assert!(request.contains("content-type: application/json"));
        assert!(request.contains("\"remote_addr\":\"192.168.1.5:42101\""));
        assert!(request.contains("\"local_addr\":\"10.0.0.2:8554\""));
        assert!(request.contains("\"path\":\"cam1\""));
    }

    #[tokio::test]
    async fn test_decision_redirect() {
        let (addr, _request) = serve_once(
            "HTTP/1.1 302 Found\r\nlocation: rtsp://upstream/foo\r\ncontent-length: 0\r\n\r\n",
        )
        .await;
        let decision = request_play_decision(
            &format!("http://{}/auth", addr),
            &payload(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(
            decision,
            AuthDecision::Redirect("rtsp://upstream/foo".to_string())
        );
    }

    #[tokio::test]
    async fn test_decision_redirect_without_location() {
        let (addr, _request) =
            serve_once("HTTP/1.1 302 Found\r\ncontent-length: 0\r\n\r\n").await;
        let err = request_play_decision(
            &format!("http://{}/auth", addr),
            &payload(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_decision_deny() {
        let (addr, _request) =
            serve_once("HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n").await;
        let decision = request_play_decision(
            &format!("http://{}/auth", addr),
            &payload(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(decision, AuthDecision::Deny);
    }

    #[tokio::test]
    async fn test_decision_unclassified_status() {
        let (addr, _request) =
            serve_once("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n").await;
        let err = request_play_decision(
            &format!("http://{}/auth", addr),
            &payload(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_decision_transport_failure() {
        // bind and drop so the port is very likely closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = request_play_decision(
            &format!("http://{}/auth", addr),
            &payload(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::Upstream(_)));
    }
}
