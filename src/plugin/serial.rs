//! Table-driven serial device plugin.
//!
//! The plugin definition maps command names to printf-style templates. On
//! `execute` the template is rendered from the command params, written to the
//! port as-is (templates carry their own terminators), and, if `read_response`
//! is set, one response line is read back.
//!
//! Ports open 8N1 without flow control. With `plugins.mock_serial` the port is
//! replaced by an in-memory link that records writes and answers `OK`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(feature = "serial")]
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
#[cfg(feature = "serial")]
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::PluginError;
use crate::plugin::template::{CommandTemplate, TemplateError};
use crate::plugin::{ensure_ready, Plugin, PluginState, PluginStatus, PluginType};
use crate::protocol::{Params, SerialDeviceSpec};

/// Bytes written through a mock link, shared with tests.
pub type MockWrites = Arc<Mutex<Vec<String>>>;

enum Link {
    #[cfg(feature = "serial")]
    Serial(BufReader<SerialStream>),
    Mock { writes: MockWrites, response: String },
}

impl Link {
    async fn write_all(&mut self, data: &str) -> std::io::Result<()> {
        match self {
            #[cfg(feature = "serial")]
            Link::Serial(port) => {
                port.get_mut().write_all(data.as_bytes()).await?;
                port.get_mut().flush().await
            }
            Link::Mock { writes, .. } => {
                match writes.lock() {
                    Ok(mut w) => w.push(data.to_string()),
                    Err(poisoned) => poisoned.into_inner().push(data.to_string()),
                }
                Ok(())
            }
        }
    }

    #[cfg_attr(not(feature = "serial"), allow(unused_variables))]
    async fn read_line(&mut self, limit: Duration) -> std::io::Result<Option<String>> {
        match self {
            #[cfg(feature = "serial")]
            Link::Serial(port) => {
                let mut line = String::new();
                match tokio::time::timeout(limit, port.read_line(&mut line)).await {
                    Ok(Ok(0)) => Ok(None),
                    Ok(Ok(_)) => Ok(Some(line.trim_end().to_string())),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Ok(None),
                }
            }
            Link::Mock { response, .. } => Ok(Some(response.clone())),
        }
    }
}

pub struct SerialPlugin {
    name: String,
    critical: bool,
    spec: SerialDeviceSpec,
    baud_rate: u32,
    read_timeout: Duration,
    use_mock: bool,
    mock_writes: MockWrites,
    templates: BTreeMap<String, CommandTemplate>,
    link: Option<Link>,
    state: PluginState,
    last_error: Option<String>,
}

impl SerialPlugin {
    pub fn new(
        name: impl Into<String>,
        critical: bool,
        spec: SerialDeviceSpec,
        default_baud_rate: u32,
        read_timeout: Duration,
        use_mock: bool,
    ) -> Self {
        Self {
            name: name.into(),
            critical,
            baud_rate: spec.baud_rate.unwrap_or(default_baud_rate),
            spec,
            read_timeout,
            use_mock,
            mock_writes: Arc::new(Mutex::new(Vec::new())),
            templates: BTreeMap::new(),
            link: None,
            state: PluginState::Uninitialized,
            last_error: None,
        }
    }

    /// Writes recorded by the mock link (empty for real ports)
    pub fn mock_writes(&self) -> MockWrites {
        Arc::clone(&self.mock_writes)
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn open_link(&self) -> Result<Link, PluginError> {
        if self.use_mock {
            return Ok(Link::Mock {
                writes: Arc::clone(&self.mock_writes),
                response: "OK".to_string(),
            });
        }
        self.open_port()
    }

    #[cfg(feature = "serial")]
    fn open_port(&self) -> Result<Link, PluginError> {
        let port = tokio_serial::new(&self.spec.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.read_timeout)
            .open_native_async()
            .map_err(|e| PluginError::Connection {
                plugin: self.name.clone(),
                message: format!("failed to open {}: {}", self.spec.port, e),
            })?;
        Ok(Link::Serial(BufReader::new(port)))
    }

    #[cfg(not(feature = "serial"))]
    fn open_port(&self) -> Result<Link, PluginError> {
        Err(PluginError::Connection {
            plugin: self.name.clone(),
            message: format!(
                "cannot open {}: built without serial support (enable the 'serial' feature or set plugins.mock_serial)",
                self.spec.port
            ),
        })
    }

    fn template(&self, command: &str) -> Result<&CommandTemplate, PluginError> {
        self.templates
            .get(command)
            .or_else(|| {
                self.templates
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(command))
                    .map(|(_, t)| t)
            })
            .ok_or_else(|| PluginError::UnknownCommand {
                plugin: self.name.clone(),
                command: command.to_string(),
            })
    }

    fn template_error(&self, command: &str, err: TemplateError) -> PluginError {
        match err {
            TemplateError::Mismatch { expected, actual } => PluginError::ParameterMismatch {
                plugin: self.name.clone(),
                command: command.to_string(),
                expected,
                actual,
            },
            other => PluginError::Parameter {
                plugin: self.name.clone(),
                message: format!("command '{}': {}", command, other),
            },
        }
    }
}

#[async_trait::async_trait]
impl Plugin for SerialPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn plugin_type(&self) -> PluginType {
        PluginType::SerialDevice
    }

    async fn initialize(&mut self) -> Result<(), PluginError> {
        self.state = PluginState::Initializing;

        let mut templates = BTreeMap::new();
        for (command, source) in &self.spec.commands {
            match CommandTemplate::parse(source) {
                Ok(t) => {
                    templates.insert(command.clone(), t);
                }
                Err(e) => {
                    self.state = PluginState::Uninitialized;
                    let err = PluginError::InvalidDefinition {
                        plugin: self.name.clone(),
                        message: format!("command '{}': {}", command, e),
                    };
                    self.last_error = Some(err.to_string());
                    return Err(err);
                }
            }
        }
        self.templates = templates;

        match self.open_link() {
            Ok(link) => {
                self.link = Some(link);
                self.state = PluginState::Ready;
                tracing::info!(
                    plugin = %self.name,
                    port = %self.spec.port,
                    baud = self.baud_rate,
                    mock = self.use_mock,
                    "Serial plugin connected"
                );
                Ok(())
            }
            Err(e) => {
                self.state = PluginState::Uninitialized;
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(&mut self, command: &str, params: &Params) -> Result<Value, PluginError> {
        ensure_ready(&self.name, self.state)?;

        let rendered = {
            let template = self.template(command)?;
            template
                .render_params(params)
                .map_err(|e| self.template_error(command, e))?
        };

        let name = self.name.clone();
        let read_response = self.spec.read_response;
        let read_timeout = self.read_timeout;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| PluginError::NotInitialized(name.clone()))?;

        self.state = PluginState::Executing;
        tracing::debug!(plugin = %name, command, data = ?rendered, "Serial write");

        let result = async {
            link.write_all(&rendered).await?;
            if read_response {
                link.read_line(read_timeout).await
            } else {
                Ok(None)
            }
        }
        .await;
        self.state = PluginState::Ready;

        match result {
            Ok(Some(response)) => Ok(Value::String(response)),
            Ok(None) => Ok(Value::Null),
            Err(e) => {
                let err = PluginError::Connection {
                    plugin: name,
                    message: format!("command '{}': {}", command, e),
                };
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn cleanup(&mut self) -> Result<(), PluginError> {
        if self.state == PluginState::Closed {
            return Ok(());
        }
        self.state = PluginState::Closing;
        let result = match self.link.take() {
            #[cfg(feature = "serial")]
            Some(Link::Serial(mut port)) => port.get_mut().flush().await.map_err(|e| {
                PluginError::Connection {
                    plugin: self.name.clone(),
                    message: format!("flush on close failed: {}", e),
                }
            }),
            _ => Ok(()),
        };
        self.state = PluginState::Closed;
        tracing::debug!(plugin = %self.name, "Serial plugin closed");
        result
    }

    fn status(&self) -> PluginStatus {
        PluginStatus {
            name: self.name.clone(),
            plugin_type: PluginType::SerialDevice,
            state: self.state,
            critical: self.critical,
            detail: Some(match &self.last_error {
                Some(e) => format!("{} @ {} baud; last error: {}", self.spec.port, self.baud_rate, e),
                None => format!("{} @ {} baud", self.spec.port, self.baud_rate),
            }),
        }
    }
}
