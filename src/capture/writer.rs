//! Shared pcap/pcapng output with periodic rotation.
//!
//! One writer serves every connection; open/write/rotate/close are
//! serialized by a single lock. Data is written to a temp file and
//! atomically renamed into its timestamped final name at rotation, so
//! consumers never observe a partially written final file.

use crate::config::{CaptureConfig, CaptureFormat};
use crate::error::CaptureError;
use pcap_file::pcap::{PcapPacket, PcapWriter};
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::PcapNgWriter;
use pcap_file::DataLink;
use std::borrow::Cow;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

enum PcapSink {
    Pcap(PcapWriter<File>),
    Pcapng(PcapNgWriter<File>),
}

struct ActiveFile {
    sink: PcapSink,
    tmp_path: PathBuf,
}

pub struct CaptureWriter {
    inner: Mutex<Option<ActiveFile>>,
    directory: PathBuf,
    format: CaptureFormat,
    service_name: String,
}

impl CaptureWriter {
    pub fn new(cfg: &CaptureConfig) -> Result<Self, CaptureError> {
        std::fs::create_dir_all(&cfg.directory)
            .map_err(|e| CaptureError::Open(format!("{}: {e}", cfg.directory.display())))?;
        let writer = Self {
            inner: Mutex::new(None),
            directory: cfg.directory.clone(),
            format: cfg.format,
            service_name: cfg.service_name.clone(),
        };
        let active = writer.open_file()?;
        *writer.inner.lock().expect("capture lock poisoned") = Some(active);
        Ok(writer)
    }

    fn extension(&self) -> &'static str {
        match self.format {
            CaptureFormat::Pcap => "pcap",
            CaptureFormat::Pcapng => "pcapng",
        }
    }

    fn tmp_path(&self) -> PathBuf {
        self.directory
            .join(format!(".{}.{}.tmp", self.service_name, self.extension()))
    }

    /// Opens a fresh temp file. The container header is written exactly
    /// once here, by the sink constructor.
    fn open_file(&self) -> Result<ActiveFile, CaptureError> {
        let tmp_path = self.tmp_path();
        let file = File::create(&tmp_path)
            .map_err(|e| CaptureError::Open(format!("{}: {e}", tmp_path.display())))?;
        let sink = match self.format {
            CaptureFormat::Pcap => PcapSink::Pcap(
                PcapWriter::new(file).map_err(|e| CaptureError::Open(e.to_string()))?,
            ),
            CaptureFormat::Pcapng => {
                let mut writer =
                    PcapNgWriter::new(file).map_err(|e| CaptureError::Open(e.to_string()))?;
                writer
                    .write_pcapng_block(InterfaceDescriptionBlock {
                        linktype: DataLink::ETHERNET,
                        snaplen: 0,
                        options: vec![],
                    })
                    .map_err(|e| CaptureError::Open(e.to_string()))?;
                PcapSink::Pcapng(writer)
            }
        };
        Ok(ActiveFile { sink, tmp_path })
    }

    /// Append one link-layer frame. If the temp file vanished out from
    /// under us it is transparently recreated.
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let mut guard = self.inner.lock().expect("capture lock poisoned");

        let needs_reopen = match guard.as_ref() {
            Some(active) => !active.tmp_path.exists(),
            None => true,
        };
        if needs_reopen {
            if guard.is_some() {
                warn!("capture file vanished; reopening");
            }
            *guard = Some(self.open_file()?);
        }

        let active = guard.as_mut().expect("just opened");
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        match &mut active.sink {
            PcapSink::Pcap(writer) => {
                writer
                    .write_packet(&PcapPacket::new(timestamp, frame.len() as u32, frame))
                    .map_err(|e| CaptureError::Write(e.to_string()))?;
            }
            PcapSink::Pcapng(writer) => {
                writer
                    .write_pcapng_block(EnhancedPacketBlock {
                        interface_id: 0,
                        timestamp,
                        original_len: frame.len() as u32,
                        data: Cow::Borrowed(frame),
                        options: vec![],
                    })
                    .map_err(|e| CaptureError::Write(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Close the current temp file, publish it under its timestamped
    /// final name, and open a fresh temp file.
    pub fn rotate(&self) -> Result<PathBuf, CaptureError> {
        let mut guard = self.inner.lock().expect("capture lock poisoned");

        let final_path = self.directory.join(format!(
            "{}_{}.{}",
            self.service_name,
            chrono::Local::now().format("%Y-%m-%d_%H.%M.%S"),
            self.extension()
        ));

        if let Some(active) = guard.take() {
            let tmp_path = active.tmp_path;
            // Drop the sink first so the file is flushed and closed
            // before the rename makes it visible.
            drop(active.sink);
            std::fs::rename(&tmp_path, &final_path).map_err(|e| {
                CaptureError::Rotate(format!(
                    "{} -> {}: {e}",
                    tmp_path.display(),
                    final_path.display()
                ))
            })?;
        }

        *guard = Some(self.open_file()?);
        Ok(final_path)
    }

    /// Final flush at shutdown; the trailing temp file is published too.
    pub fn close(&self) {
        match self.rotate() {
            Ok(path) => info!(path = %path.display(), "capture finalized"),
            Err(e) => warn!(error = %e, "failed to finalize capture"),
        }
        let mut guard = self.inner.lock().expect("capture lock poisoned");
        if let Some(active) = guard.take() {
            let _ = std::fs::remove_file(&active.tmp_path);
        }
    }
}

/// Background rotation loop; one per process.
pub async fn run_rotation(
    writer: std::sync::Arc<CaptureWriter>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so the first file
    // covers a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match writer.rotate() {
                    Ok(path) => info!(path = %path.display(), "capture rotated"),
                    Err(e) => warn!(error = %e, "capture rotation failed"),
                }
            }
        }
    }
    writer.close();
}
