use crate::telemetry::RawSample;
use std::future::Future;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const GPSD_WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"json\":true}\n";
const TPV_CLASS: &str = "TPV";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("telemetry source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supplier of raw positioning samples.
pub trait TelemetrySource {
    /// Wait for the next sample. `Ok(None)` means the source closed.
    fn next_sample(&mut self) -> impl Future<Output = Result<Option<RawSample>, SourceError>> + Send;
}

/// gpsd JSON client yielding every TPV report.
#[derive(Debug)]
pub struct GpsdSource<R, W> {
    reader: R,
    // Held so the daemon keeps the watch open
    _writer: W,
    line: String,
    reports_skipped: u64,
}

impl GpsdSource<BufReader<tokio::net::tcp::OwnedReadHalf>, OwnedWriteHalf> {
    pub async fn connect(address: &str) -> Result<Self, SourceError> {
        let stream = TcpStream::connect(address).await?;
        let (reader, writer) = stream.into_split();
        let source = Self::watch(BufReader::new(reader), writer).await?;
        info!("🛰️  Watching gpsd at {}", address);
        Ok(source)
    }
}

impl<R, W> GpsdSource<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Enable JSON watch mode on an established gpsd connection.
    pub async fn watch(reader: R, mut writer: W) -> Result<Self, SourceError> {
        writer.write_all(GPSD_WATCH_COMMAND.as_bytes()).await?;
        writer.flush().await?;
        Ok(Self {
            reader,
            _writer: writer,
            line: String::new(),
            reports_skipped: 0,
        })
    }

    /// Reports that were not TPV or could not be parsed.
    pub fn reports_skipped(&self) -> u64 {
        self.reports_skipped
    }

    fn parse_report(&mut self) -> Option<RawSample> {
        let trimmed = self.line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let report: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring malformed gpsd report: {}", e);
                self.reports_skipped += 1;
                return None;
            }
        };
        let object = report.as_object()?;
        match object.get("class").and_then(serde_json::Value::as_str) {
            Some(TPV_CLASS) => Some(RawSample::from_json_object(object)),
            class => {
                debug!("Skipping gpsd report class {:?}", class);
                self.reports_skipped += 1;
                None
            }
        }
    }
}

impl<R, W> TelemetrySource for GpsdSource<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_sample(&mut self) -> Result<Option<RawSample>, SourceError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                info!("gpsd closed the connection");
                return Ok(None);
            }
            if let Some(sample) = self.parse_report() {
                return Ok(Some(sample));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RawValue;

    #[tokio::test]
    async fn test_yields_tpv_reports_only() {
        let stream: &[u8] = br#"{"class":"VERSION","release":"3.22"}
{"class":"DEVICES","devices":[]}
not json
{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2024-01-01T00:00:00.000Z","lat":40.42,"lon":-86.91,"alt":"n/a"}
{"class":"SKY","satellites":[]}
"#;
        let mut written = Vec::new();
        let mut source = GpsdSource::watch(stream, &mut written).await.unwrap();

        let sample = source.next_sample().await.unwrap().unwrap();
        assert_eq!(sample.get("lat"), &RawValue::Number(40.42));
        assert_eq!(sample.get("alt"), &RawValue::Unavailable);
        assert!(source.next_sample().await.unwrap().is_none());
        assert_eq!(source.reports_skipped(), 4);
        drop(source);

        assert_eq!(written, GPSD_WATCH_COMMAND.as_bytes());
    }
}
