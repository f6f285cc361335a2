//! Wire formats for the three synchronisation protocols.
//!
//! The wall-clock protocol is binary, datagram-oriented: fixed 31-byte
//! packets in network byte order, timestamps as signed nanoseconds.
//! The timeline and content-id protocols are line-delimited JSON over
//! persistent TCP connections; field names below are the wire names.

use serde::{Deserialize, Serialize};

use crate::clock::{ControlTimestamp, Correlation, TickRate};

// ---------------------------------------------------------------------------
// Wall-clock packets

pub const WC_PACKET_LEN: usize = 31;
pub const WC_VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcMsgType {
    Request,
    Response,
}

/// One wall-clock datagram:
/// `version(1) type(1) precision(1) max_freq_error(4) originate(8)
/// receive(8) transmit(8)`, big-endian.
///
/// `precision` is log2 seconds; `max_freq_error` is in units of 1/256 ppm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WcPacket {
    pub msg_type: WcMsgType,
    pub precision_log2: i8,
    pub max_freq_error_ppm_256: u32,
    pub originate_nanos: i64,
    pub receive_nanos: i64,
    pub transmit_nanos: i64,
}

impl WcPacket {
    pub fn request(originate_nanos: i64) -> Self {
        WcPacket {
            msg_type: WcMsgType::Request,
            precision_log2: 0,
            max_freq_error_ppm_256: 0,
            originate_nanos,
            receive_nanos: 0,
            transmit_nanos: 0,
        }
    }

    /// Precision in seconds, from the log2 exponent.
    pub fn precision_secs(&self) -> f64 {
        2f64.powi(self.precision_log2 as i32)
    }

    pub fn max_freq_error_ppm(&self) -> f64 {
        self.max_freq_error_ppm_256 as f64 / 256.0
    }

    /// Encode a measured precision (seconds) as the nearest not-smaller
    /// power of two.
    pub fn encode_precision(precision_secs: f64) -> i8 {
        precision_secs.log2().ceil() as i8
    }

    pub fn encode(&self) -> [u8; WC_PACKET_LEN] {
        let mut buf = [0u8; WC_PACKET_LEN];
        buf[0] = WC_VERSION;
        buf[1] = match self.msg_type {
            WcMsgType::Request => 0,
            WcMsgType::Response => 1,
        };
        buf[2] = self.precision_log2 as u8;
        buf[3..7].copy_from_slice(&self.max_freq_error_ppm_256.to_be_bytes());
        buf[7..15].copy_from_slice(&self.originate_nanos.to_be_bytes());
        buf[15..23].copy_from_slice(&self.receive_nanos.to_be_bytes());
        buf[23..31].copy_from_slice(&self.transmit_nanos.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Option<WcPacket> {
        if data.len() < WC_PACKET_LEN || data[0] != WC_VERSION {
            return None;
        }
        let msg_type = match data[1] {
            0 => WcMsgType::Request,
            1 => WcMsgType::Response,
            _ => return None,
        };
        Some(WcPacket {
            msg_type,
            precision_log2: data[2] as i8,
            max_freq_error_ppm_256: u32::from_be_bytes(data[3..7].try_into().unwrap()),
            originate_nanos: i64::from_be_bytes(data[7..15].try_into().unwrap()),
            receive_nanos: i64::from_be_bytes(data[15..23].try_into().unwrap()),
            transmit_nanos: i64::from_be_bytes(data[23..31].try_into().unwrap()),
        })
    }
}

// ---------------------------------------------------------------------------
// Timeline protocol (JSON)

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRateMsg {
    /// Units per second.
    pub num: u32,
    /// Units per tick.
    pub den: u32,
}

impl From<TickRate> for TickRateMsg {
    fn from(rate: TickRate) -> Self {
        TickRateMsg { num: rate.units_per_sec, den: rate.units_per_tick }
    }
}

impl From<TickRateMsg> for TickRate {
    fn from(msg: TickRateMsg) -> Self {
        TickRate { units_per_tick: msg.den, units_per_sec: msg.num }
    }
}

/// Client→server setup message, sent once per timeline connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSetup {
    pub content_id_stem: String,
    pub timeline_selector: String,
    pub tick_rate: TickRateMsg,
}

/// Server→client control timestamp. The null variant (timeline
/// unavailable) carries null content time, wall-clock time and speed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTimestampMsg {
    pub content_id: String,
    pub content_id_status: String,
    pub presentation_status: String,
    pub timeline_selector: String,
    pub tick_rate: TickRateMsg,
    pub content_time: Option<i64>,
    pub wall_clock_time: Option<i64>,
    pub timeline_speed_multiplier: Option<f64>,
}

impl ControlTimestampMsg {
    /// A CT announcing that the requested timeline is unavailable.
    pub fn null(content_id: &str, selector: &str, rate: TickRate) -> Self {
        ControlTimestampMsg {
            content_id: content_id.to_string(),
            content_id_status: "final".to_string(),
            presentation_status: "okay".to_string(),
            timeline_selector: selector.to_string(),
            tick_rate: rate.into(),
            content_time: None,
            wall_clock_time: None,
            timeline_speed_multiplier: None,
        }
    }

    pub fn from_correlation(
        content_id: &str,
        selector: &str,
        rate: TickRate,
        correlation: Correlation,
    ) -> Self {
        ControlTimestampMsg {
            content_time: Some(correlation.ticks),
            wall_clock_time: Some(correlation.wall_nanos),
            timeline_speed_multiplier: Some(correlation.speed),
            ..Self::null(content_id, selector, rate)
        }
    }

    /// The domain view of this message.
    pub fn to_control_timestamp(&self) -> ControlTimestamp {
        let correlation = match (self.content_time, self.wall_clock_time, self.timeline_speed_multiplier) {
            (Some(ticks), Some(wall_nanos), Some(speed)) => {
                Some(Correlation { wall_nanos, ticks, speed })
            }
            _ => None,
        };
        ControlTimestamp {
            content_id: self.content_id.clone(),
            tick_rate: self.tick_rate.into(),
            correlation,
        }
    }
}

// ---------------------------------------------------------------------------
// Content-id protocol (JSON)

/// The record the content-id service pushes on connect. Static for the
/// duration of a measurement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiiMsg {
    pub protocol_version: String,
    pub content_id: String,
    pub content_id_status: String,
    pub presentation_status: String,
    pub wc_url: String,
    pub ts_url: String,
}

impl CiiMsg {
    pub fn new(content_id: &str, wc_url: &str, ts_url: &str) -> Self {
        CiiMsg {
            protocol_version: "1.1".to_string(),
            content_id: content_id.to_string(),
            content_id_status: "final".to_string(),
            presentation_status: "okay".to_string(),
            wc_url: wc_url.to_string(),
            ts_url: ts_url.to_string(),
        }
    }
}

/// Prefix match used for content-id stems; an empty stem matches anything.
pub fn stem_matches(stem: &str, content_id: &str) -> bool {
    content_id.starts_with(stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wc_packet_round_trip() {
        let pkt = WcPacket {
            msg_type: WcMsgType::Response,
            precision_log2: -20,
            max_freq_error_ppm_256: 500 * 256,
            originate_nanos: 1_424_652_124_816_656_128,
            receive_nanos: 1_424_652_124_816_756_128,
            transmit_nanos: -42,
        };
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), WC_PACKET_LEN);
        let parsed = WcPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, pkt);
        assert_eq!(parsed.max_freq_error_ppm(), 500.0);
        assert!((parsed.precision_secs() - 2f64.powi(-20)).abs() < 1e-12);
    }

    #[test]
    fn test_wc_packet_rejects_garbage() {
        assert!(WcPacket::parse(&[0u8; 10]).is_none());
        let mut bytes = WcPacket::request(0).encode();
        bytes[0] = 9; // unknown version
        assert!(WcPacket::parse(&bytes).is_none());
        let mut bytes = WcPacket::request(0).encode();
        bytes[1] = 7; // unknown type
        assert!(WcPacket::parse(&bytes).is_none());
    }

    #[test]
    fn test_precision_encoding() {
        assert_eq!(WcPacket::encode_precision(1.0), 0);
        assert_eq!(WcPacket::encode_precision(0.001), -9); // 2^-10 < 1ms <= 2^-9
        assert_eq!(WcPacket::encode_precision(2f64.powi(-20)), -20);
    }

    #[test]
    fn test_control_timestamp_msg_wire_names() {
        let rate = TickRate::new(1, 90000);
        let msg = ControlTimestampMsg::from_correlation(
            "urn:test:content",
            "urn:dvb:css:timeline:pts",
            rate,
            Correlation { wall_nanos: 5_000_000_000, ticks: 12345678, speed: 1.0 },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["contentId"], "urn:test:content");
        assert_eq!(json["tickRate"]["num"], 90000);
        assert_eq!(json["tickRate"]["den"], 1);
        assert_eq!(json["contentTime"], 12345678);
        assert_eq!(json["wallClockTime"], 5_000_000_000i64);
        assert_eq!(json["timelineSpeedMultiplier"], 1.0);

        let back: ControlTimestampMsg = serde_json::from_value(json).unwrap();
        let ct = back.to_control_timestamp();
        assert_eq!(ct.tick_rate, rate);
        assert_eq!(
            ct.correlation,
            Some(Correlation { wall_nanos: 5_000_000_000, ticks: 12345678, speed: 1.0 })
        );
    }

    #[test]
    fn test_null_ct_has_no_correlation() {
        let msg = ControlTimestampMsg::null("urn:x", "urn:sel", TickRate::new(1, 90000));
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json["contentTime"].is_null());
        assert!(json["wallClockTime"].is_null());
        assert!(msg.to_control_timestamp().correlation.is_none());
    }

    #[test]
    fn test_stem_matching() {
        assert!(stem_matches("", "urn:anything"));
        assert!(stem_matches("urn:test", "urn:test:content"));
        assert!(!stem_matches("urn:other", "urn:test:content"));
    }
}
