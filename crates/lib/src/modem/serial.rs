//! Serial AT-command modem in PDU mode.
//!
//! A reader thread owns the read half of the port: unsolicited `+CMT:` deliveries are
//! decoded and pushed to the gateway's inbound channel, every other line goes to the
//! command side. Commands are serialized by the session lock and run on blocking threads.

use super::pdu::{self, SubmitPdu};
use super::{ModemError, ModemLink};
use crate::channels::InboundMessage;
use crate::config::ModemConfig;
use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(60);
const COVERAGE_POLL: Duration = Duration::from_secs(2);

/// Line-level output of the modem, as seen by the command side.
#[derive(Debug)]
enum Line {
    Text(String),
    /// The `> ` prompt after `AT+CMGS`.
    Prompt,
}

struct Session {
    port: Box<dyn SerialPort>,
    lines: std_mpsc::Receiver<Line>,
}

struct Inner {
    name: String,
    session: Mutex<Session>,
    /// Cleared by `close`; ends the reader thread.
    running: Arc<AtomicBool>,
    /// Cleared by `stop`; inbound deliveries are no longer forwarded.
    accepting: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reference: AtomicU8,
}

/// Modem on a serial port.
#[derive(Clone)]
pub struct SerialModem {
    inner: Arc<Inner>,
}

/// A message found in modem or SIM storage.
#[derive(Debug, Clone)]
pub struct StoredSms {
    pub storage: String,
    pub index: u32,
    pub sender: Option<String>,
    pub text: Option<String>,
    pub pdu: String,
}

fn open_port(port: &str, baudrate: u32) -> Result<Box<dyn SerialPort>, ModemError> {
    let mut builder = serialport::new(port, baudrate).timeout(Duration::from_millis(500));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder.open()?;
    let _ = port.write_data_terminal_ready(true);
    let _ = port.clear(serialport::ClearBuffer::All);
    Ok(port)
}

impl SerialModem {
    /// Open and initialize the modem (echo off, SIM PIN, PDU mode, direct delivery of
    /// new messages). Blocking.
    pub fn open(
        config: &ModemConfig,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<Self, ModemError> {
        log::info!(
            "modem {}: opening {} at {} baud",
            config.name,
            config.port,
            config.baudrate
        );
        let modem = Self::attach(&config.name, &config.port, config.baudrate, Some(inbound_tx))?;
        if let Err(e) = modem.initialize(config.pin.as_deref()) {
            modem.shutdown_reader();
            return Err(e);
        }
        log::info!("modem {}: ready", config.name);
        Ok(modem)
    }

    /// Open the port and start the reader without any modem setup.
    fn attach(
        name: &str,
        port: &str,
        baudrate: u32,
        inbound_tx: Option<mpsc::Sender<InboundMessage>>,
    ) -> Result<Self, ModemError> {
        let port = open_port(port, baudrate)?;
        let reader_port = port.try_clone()?;
        let (line_tx, line_rx) = std_mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let accepting = Arc::new(AtomicBool::new(true));

        let reader = LineReader {
            port: reader_port,
            running: running.clone(),
            lines: LineSplitter {
                name: name.to_string(),
                commands: line_tx,
                inbound: inbound_tx,
                accepting: accepting.clone(),
                pending: String::new(),
                expect_pdu: false,
            },
        };
        let handle = std::thread::Builder::new()
            .name(format!("modem-{}", name))
            .spawn(move || reader.run())?;

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                session: Mutex::new(Session {
                    port,
                    lines: line_rx,
                }),
                running,
                accepting,
                reader: Mutex::new(Some(handle)),
                reference: AtomicU8::new(0),
            }),
        })
    }

    fn initialize(&self, pin: Option<&str>) -> Result<(), ModemError> {
        self.command("AT", COMMAND_TIMEOUT)?;
        self.command("ATE0", COMMAND_TIMEOUT)?;
        let sim = self.command("AT+CPIN?", COMMAND_TIMEOUT)?.join(" ");
        if sim.contains("SIM PIN") {
            match pin {
                Some(pin) => {
                    log::info!("modem {}: entering SIM PIN", self.inner.name);
                    self.command(&format!("AT+CPIN={}", pin), COMMAND_TIMEOUT)?;
                }
                None => {
                    return Err(ModemError::Command {
                        command: "AT+CPIN?".to_string(),
                        response: "SIM PIN required but none configured".to_string(),
                    })
                }
            }
        }
        self.command("AT+CMGF=0", COMMAND_TIMEOUT)?;
        self.command("AT+CNMI=2,2,0,0,0", COMMAND_TIMEOUT)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Session>, ModemError> {
        self.inner.session.lock().map_err(|_| ModemError::Closed)
    }

    /// Run one AT command and collect its response lines (without the final OK).
    pub fn command(&self, cmd: &str, timeout: Duration) -> Result<Vec<String>, ModemError> {
        let mut session = self.lock()?;
        while session.lines.try_recv().is_ok() {}
        session.port.write_all(format!("{}\r", cmd).as_bytes())?;
        collect_response(&session.lines, cmd, timeout)
    }

    fn send_pdu(&self, part: &SubmitPdu) -> Result<(), ModemError> {
        let mut session = self.lock()?;
        while session.lines.try_recv().is_ok() {}
        let cmd = format!("AT+CMGS={}", part.tpdu_len);
        session.port.write_all(format!("{}\r", cmd).as_bytes())?;

        let deadline = Instant::now() + PROMPT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match session.lines.recv_timeout(remaining) {
                Ok(Line::Prompt) => break,
                Ok(Line::Text(line)) if is_error(&line) => {
                    return Err(ModemError::Command {
                        command: cmd,
                        response: line,
                    })
                }
                Ok(Line::Text(_)) => {}
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Err(ModemError::Timeout(cmd)),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Err(ModemError::Closed),
            }
        }

        session.port.write_all(part.hex.as_bytes())?;
        session.port.write_all(&[0x1A])?;
        collect_response(&session.lines, &cmd, SEND_TIMEOUT)?;
        Ok(())
    }

    /// One registration check: `+CREG: <n>,<stat>` with stat 1 (home) or 5 (roaming).
    fn registered(&self) -> Result<bool, ModemError> {
        let lines = self.command("AT+CREG?", COMMAND_TIMEOUT)?;
        Ok(lines
            .iter()
            .filter_map(|l| l.strip_prefix("+CREG:"))
            .filter_map(|rest| rest.split(',').nth(1))
            .any(|stat| matches!(stat.trim(), "1" | "5")))
    }

    fn shutdown_reader(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = self.inner.reader.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn is_error(line: &str) -> bool {
    line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
}

fn collect_response(
    lines: &std_mpsc::Receiver<Line>,
    cmd: &str,
    timeout: Duration,
) -> Result<Vec<String>, ModemError> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match lines.recv_timeout(remaining) {
            Ok(Line::Text(line)) if line == "OK" => return Ok(out),
            Ok(Line::Text(line)) if is_error(&line) => {
                return Err(ModemError::Command {
                    command: cmd.to_string(),
                    response: line,
                })
            }
            Ok(Line::Text(line)) if line == cmd => {}
            Ok(Line::Text(line)) => out.push(line),
            Ok(Line::Prompt) => {}
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                return Err(ModemError::Timeout(cmd.to_string()))
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return Err(ModemError::Closed),
        }
    }
}

struct LineReader {
    port: Box<dyn SerialPort>,
    running: Arc<AtomicBool>,
    lines: LineSplitter,
}

impl LineReader {
    /// Read until `running` is cleared by `close`. Command responses keep flowing after
    /// inbound delivery stops so queued jobs can still be sent.
    fn run(mut self) {
        let mut buf = [0u8; 512];
        while self.running.load(Ordering::SeqCst) {
            let n = match self.port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    log::error!("modem {}: read failed: {}", self.lines.name, e);
                    break;
                }
            };
            if !self.lines.feed(&String::from_utf8_lossy(&buf[..n])) {
                break;
            }
        }
        log::debug!("modem {}: reader stopped", self.lines.name);
    }
}

/// Splits modem output into lines. `+CMT:` deliveries go to the inbound channel while
/// `accepting` is set; everything else goes to the command side.
struct LineSplitter {
    name: String,
    commands: std_mpsc::Sender<Line>,
    inbound: Option<mpsc::Sender<InboundMessage>>,
    accepting: Arc<AtomicBool>,
    pending: String,
    expect_pdu: bool,
}

impl LineSplitter {
    /// Returns false once the command side is gone.
    fn feed(&mut self, chunk: &str) -> bool {
        self.pending.push_str(chunk);
        while let Some(pos) = self.pending.find('\n') {
            let line = self.pending[..pos].trim().to_string();
            self.pending.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            if self.expect_pdu {
                self.expect_pdu = false;
                self.deliver(&line);
            } else if line.starts_with("+CMT:") {
                self.expect_pdu = true;
            } else if self.commands.send(Line::Text(line)).is_err() {
                return false;
            }
        }
        if self.pending.trim() == ">" {
            self.pending.clear();
            if self.commands.send(Line::Prompt).is_err() {
                return false;
            }
        }
        true
    }

    fn deliver(&self, hex: &str) {
        let msg = match pdu::decode_deliver(hex) {
            Ok(decoded) => decoded.into_inbound(&self.name),
            Err(e) => {
                log::warn!("modem {}: undecodable message pdu ({}): {}", self.name, e, hex);
                return;
            }
        };
        if !self.accepting.load(Ordering::SeqCst) {
            log::warn!(
                "modem {}: stopping, message from {} left unprocessed",
                self.name,
                msg.sender
            );
            return;
        }
        log::info!("modem {}: message from {}", self.name, msg.sender);
        match &self.inbound {
            Some(tx) => {
                if tx.blocking_send(msg).is_err() {
                    log::warn!("modem {}: inbound channel closed, message dropped", self.name);
                }
            }
            None => log::debug!("modem {}: ignoring message from {}", self.name, msg.sender),
        }
    }
}

#[async_trait]
impl ModemLink for SerialModem {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), ModemError> {
        let reference = self.inner.reference.fetch_add(1, Ordering::Relaxed);
        let parts = pdu::encode_submit(destination, text, reference)?;
        let total = parts.len();
        for (idx, part) in parts.into_iter().enumerate() {
            let modem = self.clone();
            tokio::task::spawn_blocking(move || modem.send_pdu(&part))
                .await
                .map_err(|_| ModemError::Closed)??;
            log::debug!(
                "modem {}: sent part {}/{} to {}",
                self.inner.name,
                idx + 1,
                total,
                destination
            );
        }
        Ok(())
    }

    async fn wait_for_coverage(&self, timeout: Duration) -> Result<bool, ModemError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let modem = self.clone();
            let registered = tokio::task::spawn_blocking(move || modem.registered())
                .await
                .map_err(|_| ModemError::Closed)??;
            if registered {
                return Ok(true);
            }
            if tokio::time::Instant::now() + COVERAGE_POLL > deadline {
                return Ok(false);
            }
            tokio::time::sleep(COVERAGE_POLL).await;
        }
    }

    fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        let modem = self.clone();
        let _ = tokio::task::spawn_blocking(move || modem.shutdown_reader()).await;
        log::info!("modem {}: closed", self.inner.name);
    }
}

/// Identification and network status, as (label, value) pairs. Blocking.
pub fn modem_info(port: &str, baudrate: u32) -> Result<Vec<(String, String)>, ModemError> {
    const QUERIES: [(&str, &str); 9] = [
        ("Manufacturer", "AT+CGMI"),
        ("Model", "AT+CGMM"),
        ("Firmware", "AT+CGMR"),
        ("IMEI", "AT+CGSN"),
        ("SIM Status", "AT+CPIN?"),
        ("IMSI", "AT+CIMI"),
        ("Signal Quality", "AT+CSQ"),
        ("Network Registration", "AT+CREG?"),
        ("Operator", "AT+COPS?"),
    ];
    let modem = SerialModem::attach("info", port, baudrate, None)?;
    let result = (|| -> Result<Vec<(String, String)>, ModemError> {
        modem.command("AT", COMMAND_TIMEOUT)?;
        modem.command("ATE0", COMMAND_TIMEOUT)?;
        let mut info = Vec::with_capacity(QUERIES.len());
        for (label, cmd) in QUERIES {
            let value = match modem.command(cmd, COMMAND_TIMEOUT) {
                Ok(lines) => lines.into_iter().next().unwrap_or_else(|| "N/A".to_string()),
                Err(e) => format!("error: {}", e),
            };
            info.push((label.to_string(), value));
        }
        Ok(info)
    })();
    modem.shutdown_reader();
    result
}

/// List and delete every message in phone (ME) and SIM (SM) storage. Blocking.
pub fn clear_messages(port: &str, baudrate: u32) -> Result<Vec<StoredSms>, ModemError> {
    let modem = SerialModem::attach("clear", port, baudrate, None)?;
    let result = (|| -> Result<Vec<StoredSms>, ModemError> {
        modem.command("AT", COMMAND_TIMEOUT)?;
        modem.command("ATE0", COMMAND_TIMEOUT)?;
        modem.command("AT+CMGF=0", COMMAND_TIMEOUT)?;
        let mut removed = Vec::new();
        for storage in ["ME", "SM"] {
            if let Err(e) = modem.command(&format!("AT+CPMS=\"{}\"", storage), COMMAND_TIMEOUT) {
                log::warn!("storage {} unavailable: {}", storage, e);
                continue;
            }
            let listed = parse_cmgl(storage, &modem.command("AT+CMGL=4", Duration::from_secs(30))?);
            for sms in listed {
                modem.command(&format!("AT+CMGD={}", sms.index), COMMAND_TIMEOUT)?;
                removed.push(sms);
            }
        }
        Ok(removed)
    })();
    modem.shutdown_reader();
    result
}

/// Pair each `+CMGL: <index>,...` header with the PDU line that follows it.
fn parse_cmgl(storage: &str, lines: &[String]) -> Vec<StoredSms> {
    let mut out = Vec::new();
    let mut iter = lines.iter();
    while let Some(line) = iter.next() {
        let Some(rest) = line.strip_prefix("+CMGL:") else {
            continue;
        };
        let Some(index) = rest.split(',').next().and_then(|i| i.trim().parse().ok()) else {
            continue;
        };
        let pdu = iter.next().cloned().unwrap_or_default();
        let decoded = pdu::decode_deliver(&pdu).ok();
        out.push(StoredSms {
            storage: storage.to_string(),
            index,
            sender: decoded.as_ref().map(|d| d.sender.clone()),
            text: decoded.map(|d| d.text),
            pdu,
        });
    }
    out
}
