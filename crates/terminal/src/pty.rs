//! PTY-backed child process with dedicated I/O threads.

use std::{
    io::{Read, Write},
    sync::mpsc as std_mpsc,
};

use {
    portable_pty::{Child, MasterPty, PtySize, native_pty_system},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use crate::{
    error::{Error, Result},
    strategy::SpawnPlan,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Output chunks buffered ahead of the socket. A full queue stalls the
/// reader thread, which in turn stalls the child on its PTY writes.
const OUTPUT_QUEUE_CHUNKS: usize = 64;

/// Input frames buffered ahead of the child.
const INPUT_QUEUE_FRAMES: usize = 256;

/// `EIO` is what Linux returns from the master once the child side closes.
#[cfg(unix)]
const EIO: i32 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Error(String),
    Closed,
}

/// A running child attached to a PTY.
///
/// Output is read on one thread and input written on another, so neither
/// blocks the async runtime and both keep their order.
pub struct PtyProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    input_tx: Option<std_mpsc::SyncSender<Vec<u8>>>,
    output_rx: Option<mpsc::Receiver<PtyEvent>>,
    pid: Option<u32>,
}

impl PtyProcess {
    pub fn spawn(plan: &SpawnPlan, rows: u16, cols: u16, label: &str) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(rows, cols))
            .map_err(|e| Error::spawn(format!("failed to allocate PTY: {e}")))?;

        let portable_pty::PtyPair { master, slave } = pair;
        let child = slave
            .spawn_command(plan.command())
            .map_err(|e| Error::spawn(format!("failed to spawn `{}`: {e}", plan.program)))?;
        drop(slave);
        let pid = child.process_id();

        let reader = master
            .try_clone_reader()
            .map_err(|e| Error::spawn(format!("failed to open PTY reader: {e}")))?;
        let writer = master
            .take_writer()
            .map_err(|e| Error::spawn(format!("failed to open PTY writer: {e}")))?;

        let mut process = Self {
            master: Some(master),
            child: Some(child),
            input_tx: None,
            output_rx: None,
            pid,
        };
        // From here on a failure must still reap the child.
        match (spawn_reader(reader, label), spawn_writer(writer, label)) {
            (Ok(output_rx), Ok(input_tx)) => {
                process.output_rx = Some(output_rx);
                process.input_tx = Some(input_tx);
                Ok(process)
            },
            (Err(e), _) | (_, Err(e)) => {
                process.shutdown();
                Err(e)
            },
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue bytes for the child. Bytes are applied in call order.
    ///
    /// When the child stops reading and the queue fills up, the frame is
    /// dropped with a warning instead of blocking the caller.
    pub fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let tx = self
            .input_tx
            .as_ref()
            .ok_or_else(|| Error::pty("terminal input is closed"))?;
        match tx.try_send(bytes) {
            Ok(()) => Ok(()),
            Err(std_mpsc::TrySendError::Full(bytes)) => {
                warn!(
                    pid = ?self.pid,
                    bytes = bytes.len(),
                    "terminal input backlog full, dropping frame"
                );
                Ok(())
            },
            Err(std_mpsc::TrySendError::Disconnected(_)) => {
                Err(Error::pty("terminal input is closed"))
            },
        }
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| Error::pty("terminal is closed"))?;
        master
            .resize(pty_size(rows, cols))
            .map_err(|e| Error::pty(format!("failed to resize PTY: {e}")))
    }

    /// Next output event. `None` once the reader has stopped.
    pub async fn recv(&mut self) -> Option<PtyEvent> {
        match self.output_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop the read pump, kill the child and close the PTY.
    ///
    /// Each step runs regardless of how the previous one went. Calling this
    /// again is a no-op.
    pub fn shutdown(&mut self) {
        // Dropping the receiver makes the reader thread exit on its next send.
        self.output_rx = None;

        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = ?self.pid, ?status, "terminal child already exited");
                },
                _ => {
                    if let Err(e) = child.kill()
                        && !matches!(child.try_wait(), Ok(Some(_)))
                    {
                        warn!(pid = ?self.pid, error = %e, "failed to kill terminal child");
                    }
                    reap(child, self.pid);
                },
            }
        }

        self.input_tx = None;
        self.master = None;
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wait for a killed child on a helper thread so it does not linger as a
/// zombie and the caller never blocks.
fn reap(mut child: Box<dyn Child + Send + Sync>, pid: Option<u32>) {
    let spawned = std::thread::Builder::new()
        .name("labrun-pty-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => debug!(?pid, ?status, "terminal child reaped"),
            Err(e) => debug!(?pid, error = %e, "terminal child wait failed"),
        });
    if let Err(e) = spawned {
        warn!(?pid, error = %e, "failed to start reaper thread");
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(2),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    label: &str,
) -> Result<mpsc::Receiver<PtyEvent>> {
    let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_CHUNKS);
    std::thread::Builder::new()
        .name(format!("labrun-pty-read-{label}"))
        .spawn(move || {
            let mut buf = [0_u8; READ_CHUNK_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.blocking_send(PtyEvent::Closed);
                        break;
                    },
                    Ok(n) => {
                        if tx.blocking_send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if !is_hangup(&e) {
                            let _ = tx.blocking_send(PtyEvent::Error(format!(
                                "terminal read failed: {e}"
                            )));
                        }
                        let _ = tx.blocking_send(PtyEvent::Closed);
                        break;
                    },
                }
            }
        })
        .map_err(|e| Error::spawn(format!("failed to start PTY reader thread: {e}")))?;
    Ok(rx)
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    label: &str,
) -> Result<std_mpsc::SyncSender<Vec<u8>>> {
    let (tx, rx) = std_mpsc::sync_channel::<Vec<u8>>(INPUT_QUEUE_FRAMES);
    std::thread::Builder::new()
        .name(format!("labrun-pty-write-{label}"))
        .spawn(move || {
            while let Ok(bytes) = rx.recv() {
                if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                    debug!(error = %e, "terminal writer stopped");
                    break;
                }
            }
        })
        .map_err(|e| Error::spawn(format!("failed to start PTY writer thread: {e}")))?;
    Ok(tx)
}

#[cfg(unix)]
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(EIO)
}

#[cfg(not(unix))]
fn is_hangup(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::BrokenPipe
}
