use std::{io::Write, time::UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::encoder::SampleEncoder;
use crate::{
    error::Result,
    sample::{Field, Sample},
};

/// Tab separated phout lines:
///
/// ```text
/// <secs>.<millis> <tags>[#<id>] <rtt> <connect> <send> <latency> <receive> <interval> <req bytes> <resp bytes> <errno> <proto code>
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhoutEncoder {
    /// Append `#<id>` to the tags column.
    #[serde(default)]
    pub id: bool,
}

impl SampleEncoder for PhoutEncoder {
    fn encode(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> Result<()> {
        let ts = sample.timestamp().duration_since(UNIX_EPOCH).unwrap_or_default();
        write!(buf, "{}.{:03}\t{}", ts.as_secs(), ts.subsec_millis(), sample.tags())?;
        if self.id {
            write!(buf, "#{}", sample.id())?;
        }
        for field in Field::ALL {
            write!(buf, "\t{}", sample.get(field))?;
        }
        buf.push(b'\n');
        Ok(())
    }
}

/// One JSON object per sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesEncoder;

#[derive(Serialize)]
struct JsonSample<'a> {
    timestamp: f64,
    tag: &'a str,
    id: u64,
    rtt_us: i64,
    connect_us: i64,
    send_us: i64,
    latency_us: i64,
    receive_us: i64,
    interval_us: i64,
    request_bytes: i64,
    response_bytes: i64,
    errno: i64,
    proto_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl SampleEncoder for JsonLinesEncoder {
    fn encode(&mut self, sample: &Sample, buf: &mut Vec<u8>) -> Result<()> {
        let ts = sample.timestamp().duration_since(UNIX_EPOCH).unwrap_or_default();
        let view = JsonSample {
            timestamp: ts.as_secs_f64(),
            tag: sample.tags(),
            id: sample.id(),
            rtt_us: sample.get(Field::Rtt),
            connect_us: sample.get(Field::Connect),
            send_us: sample.get(Field::Send),
            latency_us: sample.get(Field::Latency),
            receive_us: sample.get(Field::Receive),
            interval_us: sample.get(Field::IntervalEvent),
            request_bytes: sample.get(Field::RequestBytes),
            response_bytes: sample.get(Field::ResponseBytes),
            errno: sample.get(Field::Errno),
            proto_code: sample.get(Field::ProtoCode),
            error: sample.error(),
        };
        serde_json::to_writer(&mut *buf, &view)?;
        buf.push(b'\n');
        Ok(())
    }
}
