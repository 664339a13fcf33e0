//! Secure element command channel.
//!
//! APDUs are tunneled through the modem's generic SIM access command:
//! `AT+CSIM=<len>,"<APDU>"`, answered by `+CSIM: <len>,"<DATA><SW>"` and a
//! terminal `OK`. The modem link is shared with the network data session,
//! so every command sequence runs inside a [`ChannelGuard`] that suspends the
//! session and resumes it when dropped.

pub mod chunked;
pub mod status;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use ubirch_common::{Component, Logger};

use crate::config::SimConfig;
use crate::error::{ErrorCode, Result, SimError};

pub use chunked::{ChunkState, ChunkedExchange, ChunkedTemplate, CommandTemplate};
pub use status::{CommandResult, Status};

/// ISO 7816 GET RESPONSE
pub const GET_RESPONSE: CommandTemplate = CommandTemplate::new(0x00, 0xC0, 0x00, 0x00);

/// Upper bound on continuation rounds for a single command
pub const MAX_DRAIN_ROUNDS: usize = 64;

/// Largest data field of a short APDU, in hex characters
const MAX_APDU_DATA_HEX: usize = 255 * 2;

/// `AT+CSIM=` + 3 length digits + `,"` + CLA INS P1 P2 Lc + `"`
const AT_CSIM_OVERHEAD: usize = 8 + 3 + 2 + 10 + 1;

/// Raw request/response link to the modem
pub trait Transport: Send {
    /// Longest command line the modem accepts
    fn max_command_len(&self) -> usize;

    /// Send one command line and return the complete raw response
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String>;
}

/// Network data session sharing the modem link with the SIM
pub trait DataSession: Send {
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
}

/// For links that do not carry a data session
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDataSession;

impl DataSession for NoDataSession {
    fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Hex data characters per chunk so that a rendered command fits `max_command_len`
pub fn chunk_size_for(max_command_len: usize) -> Result<usize> {
    let available = max_command_len
        .checked_sub(AT_CSIM_OVERHEAD)
        .filter(|n| *n >= 2)
        .ok_or_else(|| {
            SimError::Config(format!(
                "max command length {max_command_len} leaves no room for data"
            ))
        })?;
    Ok(available.min(MAX_APDU_DATA_HEX) & !1)
}

/// Render an APDU as an `AT+CSIM` command line
pub fn render_csim(apdu_hex: &str) -> String {
    format!("AT+CSIM={},\"{}\"", apdu_hex.len(), apdu_hex)
}

/// Parse the raw modem response of an `AT+CSIM` command
pub fn parse_csim_response(response: &str) -> Result<CommandResult> {
    let lines: Vec<&str> = response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let terminal = lines
        .last()
        .ok_or_else(|| SimError::Framing("empty modem response".to_string()))?;
    if *terminal != "OK" {
        return Ok(CommandResult::error(ErrorCode::Modem(terminal.to_string())));
    }

    let payload = lines
        .iter()
        .find_map(|l| l.strip_prefix("+CSIM:"))
        .ok_or_else(|| SimError::Framing("missing +CSIM line".to_string()))?;
    let quoted = payload
        .split_once(',')
        .map(|(_, rest)| rest.trim().trim_matches('"'))
        .ok_or_else(|| SimError::Framing(format!("malformed +CSIM line: {payload}")))?;
    if quoted.len() < 4 || quoted.len() % 2 != 0 {
        return Err(SimError::Framing(format!(
            "+CSIM payload too short or odd: {quoted}"
        )));
    }

    let (data_hex, sw_hex) = quoted.split_at(quoted.len() - 4);
    let sw = u16::from_str_radix(sw_hex, 16)
        .map_err(|_| SimError::Framing(format!("invalid status word {sw_hex}")))?;
    Ok(CommandResult::new(hex::decode(data_hex)?, Status::from_sw(sw)))
}

/// Serial command channel to the SIM applet
pub struct CommandChannel {
    transport: Box<dyn Transport>,
    session: Box<dyn DataSession>,
    timeout: Duration,
    max_command_len: usize,
    acquired: bool,
    logger: Arc<Logger>,
}

impl CommandChannel {
    pub fn new(
        transport: Box<dyn Transport>,
        session: Box<dyn DataSession>,
        timeout: Duration,
        logger: Arc<Logger>,
    ) -> Self {
        let max_command_len = transport.max_command_len();
        Self {
            transport,
            session,
            timeout,
            max_command_len,
            acquired: false,
            logger: Arc::new(logger.with_component(Component::Channel)),
        }
    }

    /// Channel using the configured timeout and command length.
    ///
    /// The effective command length is the smaller of the configured value
    /// and what the transport accepts; it must leave room for data.
    pub fn from_config(
        transport: Box<dyn Transport>,
        session: Box<dyn DataSession>,
        config: &SimConfig,
        logger: Arc<Logger>,
    ) -> Result<Self> {
        let transport_limit = transport.max_command_len();
        let max_command_len = config.max_command_len.min(transport_limit);
        chunk_size_for(max_command_len)?;
        let mut channel = Self::new(transport, session, config.command_timeout(), logger);
        channel.max_command_len = max_command_len;
        channel.logger.debug(format!(
            "command length {max_command_len} (transport {transport_limit}), timeout {:?}",
            channel.timeout
        ));
        Ok(channel)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Longest command line this channel renders
    pub fn max_command_len(&self) -> usize {
        self.max_command_len
    }

    /// Suspend the data session and take exclusive use of the link
    pub fn acquire(&mut self) -> Result<ChannelGuard<'_>> {
        if self.acquired {
            return Err(SimError::ExclusivityViolation(
                "channel is already acquired".to_string(),
            ));
        }
        self.session
            .suspend()
            .map_err(|e| SimError::Transport(format!("failed to suspend data session: {e}")))?;
        self.acquired = true;
        self.logger.debug("data session suspended");
        Ok(ChannelGuard { channel: self })
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    fn release(&mut self) {
        self.acquired = false;
        match self.session.resume() {
            Ok(()) => self.logger.debug("data session resumed"),
            Err(e) => self
                .logger
                .error(format!("failed to resume data session: {e}")),
        }
    }

    fn ensure_acquired(&self, what: &str) -> Result<()> {
        debug_assert!(self.acquired, "{what} issued without exclusive access");
        if self.acquired {
            Ok(())
        } else {
            Err(SimError::ExclusivityViolation(format!(
                "{what} issued without exclusive access"
            )))
        }
    }

    /// Hex data characters that fit into one command
    pub fn chunk_size(&self) -> Result<usize> {
        chunk_size_for(self.max_command_len)
    }

    /// Send a plain AT command and return its non-empty response lines.
    ///
    /// A terminal line other than `OK` is a transport error.
    pub fn send_at(&mut self, command: &str) -> Result<Vec<String>> {
        self.ensure_acquired(command)?;
        let response = self.transport.send(command, self.timeout)?;
        let lines: Vec<String> = response
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        match lines.last().map(String::as_str) {
            Some("OK") => Ok(lines[..lines.len() - 1].to_vec()),
            Some(other) => Err(SimError::Transport(format!("{command} -> {other}"))),
            None => Err(SimError::Transport(format!("{command} -> no response"))),
        }
    }

    /// One APDU, one round trip
    pub fn execute(&mut self, apdu_hex: &str) -> Result<CommandResult> {
        self.ensure_acquired("execute")?;
        let command = render_csim(apdu_hex);
        let max = self.max_command_len;
        if command.len() > max {
            return Err(SimError::Framing(format!(
                "command of {} characters exceeds limit {max}",
                command.len()
            )));
        }
        self.logger.debug_args(format_args!(">> {apdu_hex}"));
        let response = self.transport.send(&command, self.timeout)?;
        let result = parse_csim_response(&response)?;
        self.logger.debug_args(format_args!(
            "<< {} {:?}",
            hex::encode_upper(&result.data),
            result.status
        ));
        Ok(result)
    }

    /// Send `args_hex` over as many chunks as the command length allows
    pub fn execute_chunked(
        &mut self,
        template: ChunkedTemplate,
        args_hex: &str,
    ) -> Result<CommandResult> {
        let mut exchange = ChunkedExchange::new(template, args_hex, self.chunk_size()?)?;
        let mut last = CommandResult::ok(Vec::new());
        while let Some(command) = exchange.next_command() {
            last = self.execute(&command)?;
            exchange.on_result(&last)?;
        }
        if exchange.state() == ChunkState::Failed {
            self.logger.warn_args(format_args!(
                "chunked command {:02X} aborted with {:?}",
                template.template.ins, last.status
            ));
        }
        Ok(last)
    }

    /// Fetch pending response bytes announced by a `61xx` status.
    ///
    /// Any other status is passed through without touching the card.
    pub fn get_response(&mut self, status: Status) -> Result<CommandResult> {
        match status {
            Status::MoreData(pending) => self.execute(&GET_RESPONSE.render_le(pending)),
            other => Ok(CommandResult::new(Vec::new(), other)),
        }
    }

    /// Keep issuing `continuation` while the card reports pending data
    pub fn drain_more_data(
        &mut self,
        first: CommandResult,
        continuation: CommandTemplate,
    ) -> Result<CommandResult> {
        let CommandResult {
            mut data,
            mut status,
        } = first;
        let mut rounds = 0;
        while let Status::MoreData(pending) = status {
            rounds += 1;
            if rounds > MAX_DRAIN_ROUNDS {
                return Err(SimError::Framing(format!(
                    "card still reports pending data after {MAX_DRAIN_ROUNDS} rounds"
                )));
            }
            let next = self.execute(&continuation.render_le(pending))?;
            data.extend(next.data);
            status = next.status;
        }
        Ok(CommandResult::new(data, status))
    }
}

/// Exclusive use of the command channel; resumes the data session on drop
pub struct ChannelGuard<'a> {
    channel: &'a mut CommandChannel,
}

impl Deref for ChannelGuard<'_> {
    type Target = CommandChannel;

    fn deref(&self) -> &Self::Target {
        self.channel
    }
}

impl DerefMut for ChannelGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.channel
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.channel.release();
    }
}
