//! SNTP probe
//!
//! Sends a single NTPv3 client request and accepts any synchronised server
//! reply (stratum 1..=15, optionally bounded by `max_stratum` and by the
//! clock offset in `max_offset`).

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;

use super::AddressFamily;
use crate::sickbay::probe::{Probe, ProbeError};

/// NTP packet size without extensions
const NTP_PACKET_LEN: usize = 48;

/// LI = 0, VN = 3, Mode = 3 (client)
const NTP_CLIENT_HEADER: u8 = 0x1b;

/// Server mode in the low three bits of the first byte
const NTP_MODE_SERVER: u8 = 4;

/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Arguments for `method = "ntp"`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NtpArgs {
    /// NTP server hostname or address
    pub host: String,
    /// UDP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reject servers above this stratum
    #[serde(default)]
    pub max_stratum: Option<u8>,
    /// Reject servers whose clock differs from ours by more than this many seconds
    #[serde(default)]
    pub max_offset: Option<f64>,
    #[serde(default)]
    pub address_family: Option<AddressFamily>,
    /// Every resolved address must answer
    #[serde(default)]
    pub all_valid: bool,
}

fn default_port() -> u16 {
    123
}

impl NtpArgs {
    pub fn validate(&self) -> Vec<String> {
        let mut errors: Vec<String> = super::validate_host("ntp", &self.host).into_iter().collect();
        errors.extend(super::validate_family("ntp", &self.host, self.address_family));
        if self.port == 0 {
            errors.push("ntp probe port must be between 1 and 65535".to_string());
        }
        if let Some(max) = self.max_stratum {
            if max == 0 || max > 15 {
                errors.push(format!("ntp max_stratum {} must be between 1 and 15", max));
            }
        }
        if self.max_offset.is_some_and(|secs| secs <= 0.0) {
            errors.push("ntp max_offset must be positive".to_string());
        }
        errors
    }
}

/// 64-bit NTP timestamp (32.32 fixed point since 1900)
fn ntp_timestamp(time: SystemTime) -> u64 {
    let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

fn ntp_seconds(timestamp: u64) -> f64 {
    (timestamp >> 32) as f64 + (timestamp & 0xffff_ffff) as f64 / 4_294_967_296.0
}

/// Build the client request packet carrying our transmit timestamp
fn client_request(transmit: u64) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = NTP_CLIENT_HEADER;
    BigEndian::write_u64(&mut packet[40..48], transmit);
    packet
}

/// Validate a server reply and describe it
fn parse_reply(reply: &[u8], max_stratum: Option<u8>) -> Result<String, ProbeError> {
    if reply.len() < NTP_PACKET_LEN {
        return Err(ProbeError::Mismatch(format!(
            "short NTP reply of {} bytes",
            reply.len()
        )));
    }

    let mode = reply[0] & 0x07;
    if mode != NTP_MODE_SERVER {
        return Err(ProbeError::Mismatch(format!(
            "NTP reply has mode {} (expected server mode)",
            mode
        )));
    }

    let stratum = reply[1];
    if stratum == 0 || stratum > 15 {
        return Err(ProbeError::Mismatch(format!(
            "NTP server is unsynchronised (stratum {})",
            stratum
        )));
    }
    if let Some(max) = max_stratum {
        if stratum > max {
            return Err(ProbeError::Mismatch(format!(
                "stratum {} exceeds maximum stratum {}",
                stratum, max
            )));
        }
    }

    let transmit_secs = BigEndian::read_u32(&reply[40..44]);
    Ok(format!(
        "NTP reply with stratum {} (transmit timestamp {})",
        stratum, transmit_secs
    ))
}

/// Clock offset in seconds: ((t2 - t1) + (t3 - t4)) / 2
///
/// `reply` must already have passed [`parse_reply`].
fn clock_offset(reply: &[u8], sent: u64, received: u64) -> f64 {
    let server_receive = ntp_seconds(BigEndian::read_u64(&reply[32..40]));
    let server_transmit = ntp_seconds(BigEndian::read_u64(&reply[40..48]));
    ((server_receive - ntp_seconds(sent)) + (server_transmit - ntp_seconds(received))) / 2.0
}

pub struct NtpProbe {
    args: NtpArgs,
}

impl NtpProbe {
    pub fn new(args: NtpArgs) -> Self {
        Self { args }
    }

    async fn query(&self, server: SocketAddr) -> Result<String, ProbeError> {
        let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await.map_err(|e| ProbeError::Connect {
            target: server.to_string(),
            source: e,
        })?;
        let sent = ntp_timestamp(SystemTime::now());
        socket.send(&client_request(sent)).await?;

        let mut reply = [0u8; 512];
        let len = socket.recv(&mut reply).await?;
        let received = ntp_timestamp(SystemTime::now());
        let reply = &reply[..len];
        let detail = parse_reply(reply, self.args.max_stratum)?;

        if let Some(max) = self.args.max_offset {
            let offset = clock_offset(reply, sent, received);
            if offset.abs() > max {
                return Err(ProbeError::Mismatch(format!(
                    "clock offset {:.3}s from {} exceeds {}s",
                    offset, server, max
                )));
            }
        }
        Ok(format!("{} from {}", detail, server))
    }
}

#[async_trait]
impl Probe for NtpProbe {
    async fn probe(&self) -> Result<String, ProbeError> {
        let servers =
            super::resolve_targets(&self.args.host, self.args.port, self.args.address_family).await?;
        super::check_targets(&servers, self.args.all_valid, |server| self.query(server)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server_reply(stratum: u8) -> [u8; NTP_PACKET_LEN] {
        let mut reply = [0u8; NTP_PACKET_LEN];
        reply[0] = 0x1c; // LI 0, VN 3, mode 4
        reply[1] = stratum;
        BigEndian::write_u32(&mut reply[40..44], 3_900_000_000);
        reply
    }

    fn ntp(port: u16) -> NtpArgs {
        NtpArgs {
            host: "127.0.0.1".into(),
            port,
            max_stratum: None,
            max_offset: None,
            address_family: None,
            all_valid: false,
        }
    }

    /// Answer one request with a stratum 1 reply whose clock runs `skew_secs` ahead
    async fn server(skew_secs: u64) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, peer) = socket.recv_from(&mut buf).await.unwrap();
            let now = ntp_timestamp(SystemTime::now() + Duration::from_secs(skew_secs));

            let mut reply = server_reply(1);
            reply[24..32].copy_from_slice(&buf[40..48]);
            BigEndian::write_u64(&mut reply[32..40], now);
            BigEndian::write_u64(&mut reply[40..48], now);
            socket.send_to(&reply, peer).await.unwrap();
        });

        port
    }

    #[test]
    fn test_client_request_header() {
        let request = client_request(0);
        assert_eq!(request[0], 0x1b);
        assert!(request[1..].iter().all(|b| *b == 0));

        let stamped = client_request(0x0102_0304_0506_0708);
        assert_eq!(BigEndian::read_u64(&stamped[40..48]), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_ntp_timestamp_epoch() {
        let stamp = ntp_timestamp(UNIX_EPOCH + Duration::from_millis(1500));
        assert_eq!(stamp >> 32, NTP_UNIX_OFFSET + 1);
        assert!((ntp_seconds(stamp) - (NTP_UNIX_OFFSET as f64 + 1.5)).abs() < 1e-6);
    }

    #[test]
    fn test_clock_offset() {
        let t1 = ntp_timestamp(UNIX_EPOCH + Duration::from_secs(1_000));
        let t4 = ntp_timestamp(UNIX_EPOCH + Duration::from_secs(1_002));
        let server = ntp_timestamp(UNIX_EPOCH + Duration::from_secs(1_031));

        let mut reply = server_reply(1);
        BigEndian::write_u64(&mut reply[32..40], server);
        BigEndian::write_u64(&mut reply[40..48], server);
        // ((1031 - 1000) + (1031 - 1002)) / 2
        assert!((clock_offset(&reply, t1, t4) - 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_reply_accepts_synchronised_server() {
        let detail = parse_reply(&server_reply(2), None).unwrap();
        assert!(detail.contains("stratum 2"));
        assert!(detail.contains("3900000000"));
    }

    #[test]
    fn test_parse_reply_rejects_bad_replies() {
        assert!(parse_reply(&[0u8; 10], None).is_err());
        assert!(parse_reply(&server_reply(0), None).is_err());
        assert!(parse_reply(&server_reply(16), None).is_err());
        assert!(parse_reply(&server_reply(4), Some(3)).is_err());

        let mut client_mode = server_reply(2);
        client_mode[0] = NTP_CLIENT_HEADER;
        assert!(parse_reply(&client_mode, None).is_err());
    }

    #[tokio::test]
    async fn test_ntp_probe_against_local_server() {
        let port = server(0).await;
        let probe = NtpProbe::new(NtpArgs {
            max_stratum: Some(2),
            max_offset: Some(5.0),
            ..ntp(port)
        });
        let detail = probe.probe().await.unwrap();
        assert!(detail.contains("stratum 1"));
    }

    #[tokio::test]
    async fn test_ntp_rejects_skewed_clock() {
        let port = server(120).await;
        let probe = NtpProbe::new(NtpArgs {
            max_offset: Some(5.0),
            ..ntp(port)
        });
        let result = probe.probe().await;
        assert!(matches!(result, Err(ProbeError::Mismatch(m)) if m.contains("offset")));
    }

    #[test]
    fn test_ntp_validation() {
        let args = NtpArgs {
            max_stratum: Some(16),
            max_offset: Some(0.0),
            address_family: Some(AddressFamily::Ipv6),
            ..ntp(0)
        };
        assert_eq!(args.validate().len(), 4);
    }
}
