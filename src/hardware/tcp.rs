//! Network arena controller
//!
//! Line-based command/response client for arena controllers reachable over TCP.
//! Each operation renders a template from `arena.command_set`, sends it terminated
//! with `\r\n`, and reads one response line. `OK` (any case) means accepted; any
//! other answer means the controller refused the command. Templates use named
//! `{placeholders}`; a name the operation does not supply is an error, so a
//! misspelled template never reaches the hardware.
//!
//! The exact command words are deployment configuration, not part of this crate.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use strfmt::strfmt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::hardware::controller::{ensure_drivable, ArenaController, ArenaGeneration, TrialStart};

pub struct TcpArena {
    address: String,
    timeout: Duration,
    command_set: BTreeMap<String, String>,
    stream: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpArena {
    pub fn new(address: String, timeout_ms: u64, command_set: BTreeMap<String, String>) -> Self {
        Self {
            address,
            timeout: Duration::from_millis(timeout_ms),
            command_set,
            stream: Mutex::new(None),
        }
    }

    fn render(&self, operation: &str, values: &[(&str, String)]) -> Result<String> {
        let template = self
            .command_set
            .get(operation)
            .ok_or_else(|| anyhow!("no command configured for '{}'", operation))?;
        let vars: HashMap<String, String> = values
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        strfmt(template, &vars)
            .map_err(|e| anyhow!("Failed to format '{}' command '{}': {}", operation, template, e))
    }

    /// Send one command and wait up to `extra + timeout` for its response line.
    async fn transact(&self, command: &str, extra: Duration) -> Result<bool> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow!("arena connection to {} is not open", self.address))?;

        tracing::debug!(command, "Arena write");
        let line = format!("{}\r\n", command);
        stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write command: {}", command))?;
        stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush arena connection")?;

        let mut response = String::new();
        match timeout(self.timeout + extra, stream.read_line(&mut response)).await {
            Ok(Ok(0)) => anyhow::bail!("Connection closed by arena controller"),
            Ok(Ok(_)) => {
                let response = response.trim();
                tracing::debug!(response, "Arena response");
                Ok(response.eq_ignore_ascii_case("ok"))
            }
            Ok(Err(e)) => Err(e).context("Failed to read arena response"),
            Err(_) => anyhow::bail!("Timeout waiting for response to: {}", command),
        }
    }

    async fn send(&self, operation: &str, values: &[(&str, String)]) -> Result<bool> {
        let command = self.render(operation, values)?;
        self.transact(&command, Duration::ZERO).await
    }
}

#[async_trait]
impl ArenaController for TcpArena {
    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }

    async fn open(&self, generation: ArenaGeneration) -> Result<()> {
        ensure_drivable(generation)?;

        let stream = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .with_context(|| format!("Connection timeout to {}", self.address))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        stream.set_nodelay(true)?;

        *self.stream.lock().await = Some(BufReader::new(stream));
        tracing::info!(address = %self.address, %generation, "Connected to arena controller");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.stream.lock().await.is_none() {
            return Ok(());
        }
        // Best effort: a dead link must not keep the socket from being released
        match self.stop_display().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(address = %self.address, "Arena refused stop_display on close")
            }
            Err(e) => tracing::warn!(
                address = %self.address,
                error = format!("{:#}", e),
                "Failed to stop display on close"
            ),
        }

        let stream = self.stream.lock().await.take();
        if let Some(mut stream) = stream {
            stream
                .get_mut()
                .shutdown()
                .await
                .context("Failed to shut down arena connection")?;
            tracing::info!(address = %self.address, "Arena connection closed");
        }
        Ok(())
    }

    async fn all_on(&self) -> Result<bool> {
        self.send("all_on", &[]).await
    }

    async fn all_off(&self) -> Result<bool> {
        self.send("all_off", &[]).await
    }

    async fn stop_display(&self) -> Result<bool> {
        self.send("stop_display", &[]).await
    }

    async fn set_position_x(&self, x: u16) -> Result<()> {
        if !self.send("set_position_x", &[("x", x.to_string())]).await? {
            anyhow::bail!("controller refused set_position_x {}", x);
        }
        Ok(())
    }

    async fn set_color_depth(&self, depth: u8) -> Result<()> {
        if !self
            .send("set_color_depth", &[("depth", depth.to_string())])
            .await?
        {
            anyhow::bail!("controller refused set_color_depth {}", depth);
        }
        Ok(())
    }

    async fn start_trial(&self, trial: TrialStart) -> Result<bool> {
        let command = self.render(
            "start_trial",
            &[
                ("mode", trial.mode.to_string()),
                ("pattern_id", trial.pattern_id.to_string()),
                ("frame_rate", trial.frame_rate.to_string()),
                ("frame_index", trial.frame_index.to_string()),
                ("gain", trial.gain.to_string()),
                ("duration", trial.duration_units.to_string()),
            ],
        )?;
        // The controller answers after the trial when asked to wait for completion
        let extra = if trial.wait_for_completion {
            Duration::from_millis(u64::from(trial.duration_units) * 100)
        } else {
            Duration::ZERO
        };
        self.transact(&command, extra).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_command_set;
    use tokio::net::TcpListener;

    /// Fake controller answering `OK` to everything except lines starting with `ALL_OFF`.
    async fn spawn_fake_controller() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = if line.starts_with("ALL_OFF") { "ERR\r\n" } else { "OK\r\n" };
                seen.push(line);
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
            seen
        });
        (address, handle)
    }

    #[tokio::test]
    async fn renders_commands_and_interprets_responses() {
        let (address, server) = spawn_fake_controller().await;
        let arena = TcpArena::new(address, 1000, default_command_set());
        arena.open(ArenaGeneration::G4).await.unwrap();

        assert!(arena.all_on().await.unwrap());
        assert!(!arena.all_off().await.unwrap());
        arena.set_position_x(12).await.unwrap();
        let trial = TrialStart {
            mode: 2,
            pattern_id: 5,
            frame_rate: 30,
            frame_index: 1,
            gain: -4,
            duration_units: 1,
            wait_for_completion: false,
        };
        assert!(arena.start_trial(trial).await.unwrap());
        arena.close().await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                "ALL_ON".to_string(),
                "ALL_OFF".to_string(),
                "SET_POSITION_X 12".to_string(),
                "TRIAL 2 5 30 1 -4 1".to_string(),
                "STOP_DISPLAY".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn close_stops_the_display_once() {
        let (address, server) = spawn_fake_controller().await;
        let arena = TcpArena::new(address, 1000, default_command_set());
        arena.open(ArenaGeneration::G6).await.unwrap();
        arena.all_on().await.unwrap();
        arena.close().await.unwrap();
        arena.close().await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen.last().map(String::as_str), Some("STOP_DISPLAY"));
        assert_eq!(seen.iter().filter(|l| *l == "STOP_DISPLAY").count(), 1);
    }

    #[tokio::test]
    async fn unknown_template_names_are_rejected_before_sending() {
        let mut command_set = default_command_set();
        command_set.insert("start_trial".into(), "TRIAL {mode} {pattern}".into());
        let arena = TcpArena::new("127.0.0.1:9".into(), 100, command_set);
        let trial = TrialStart {
            mode: 2,
            pattern_id: 5,
            frame_rate: 30,
            frame_index: 1,
            gain: 0,
            duration_units: 10,
            wait_for_completion: false,
        };

        let err = arena.start_trial(trial).await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Failed to format 'start_trial'"), "{}", message);
        assert_eq!(
            arena.render("set_position_x", &[("x", "7".into())]).unwrap(),
            "SET_POSITION_X 7"
        );
    }

    #[tokio::test]
    async fn commands_fail_when_not_connected() {
        let arena = TcpArena::new("127.0.0.1:9".into(), 100, default_command_set());
        assert!(arena.all_on().await.is_err());
        assert!(arena.close().await.is_ok());
    }
}
