/// file: src/ui.rs
/// description: terminal presentation of aggregator notifications and stdin controls
use crate::{
    aggregator::LiveEventsHandle,
    error::LiveEventsError,
    events::{AggregatorEvent, EventReceiver},
    formatter::{Colors, EventFormatter, OutputFormat},
    types::{ClientSideFilters, ConnectionState, FilterUpdate},
};
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct UIOptions {
    pub colored: bool,
    pub quiet: bool,
    pub max_printed: Option<u64>,
}

pub struct UIController {
    event_receiver: EventReceiver,
    handle: LiveEventsHandle,
    formatter: EventFormatter,
    colored: bool,
    quiet_mode: bool,
    header_printed: bool,
    max_printed: Option<u64>,
}

impl UIController {
    pub fn new(
        event_receiver: EventReceiver,
        handle: LiveEventsHandle,
        format: OutputFormat,
        options: UIOptions,
    ) -> Self {
        Self {
            event_receiver,
            handle,
            formatter: EventFormatter::new(format, options.colored, options.quiet),
            colored: options.colored,
            quiet_mode: options.quiet,
            header_printed: false,
            max_printed: options.max_printed,
        }
    }

    pub async fn run(&mut self) {
        self.print_banner();
        while let Some(event) = self.event_receiver.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: AggregatorEvent) -> bool {
        match event {
            AggregatorEvent::Starting => {
                info!("Aggregator starting...");
            }
            AggregatorEvent::Connecting {
                connection_id,
                event_type,
            } => {
                let scope = event_type.as_deref().unwrap_or("all events");
                self.print_status("CONNECTING", &format!("{} ({})", scope, connection_id));
            }
            AggregatorEvent::Connected { connection_id } => {
                self.print_status("CONNECTED", &format!("ID: {}", connection_id));
                if !self.header_printed {
                    self.formatter.print_header();
                    self.header_printed = true;
                }
            }
            AggregatorEvent::EventsFlushed { batch, .. } => {
                // only what passes the client-side filters is shown
                let filters = self.handle.client_side_filters().await;
                for event in batch.iter().filter(|e| filters.matches(e)) {
                    self.formatter.print_event(event);

                    if let Some(max) = self.max_printed
                        && self.formatter.event_count() >= max
                    {
                        self.print_status("STOPPING", &format!("Printed configured max events ({max})"));
                        return false;
                    }
                }
            }
            AggregatorEvent::MalformedPayload { reason } => {
                debug!("Malformed payload dropped: {}", reason);
            }
            AggregatorEvent::ConnectionFailed(message) => {
                self.print_error("CONNECTION FAILED", &message);
            }
            AggregatorEvent::StreamEnded => {
                self.print_status("DISCONNECTED", "Stream closed by server");
            }
            AggregatorEvent::StateChanged(state) => {
                if state == ConnectionState::Paused {
                    self.print_status("PAUSED", "Stream paused, buffer kept");
                }
            }
            AggregatorEvent::StatsUpdated(stats) => {
                debug!(users_on_product = ?stats.users_on_product, "Stats updated");
            }
            AggregatorEvent::EventsCleared => {
                self.print_status("CLEARED", "Event buffer cleared");
            }
            AggregatorEvent::Stopping => {
                self.print_status("STOPPING", "Aggregator shutting down");
                return false;
            }
        }

        true
    }

    fn print_banner(&self) {
        if self.quiet_mode {
            return;
        }
        let (bold, cyan, reset) = if self.colored {
            (Colors::BOLD, Colors::BRIGHT_CYAN, Colors::RESET)
        } else {
            ("", "", "")
        };
        println!();
        println!("{bold}{cyan}LIVE EVENTS v{}{reset}", env!("CARGO_PKG_VERSION"));
        println!(
            "{}commands: p pause | r resume | e [type] event type | f [k=v] filter | c clear | s stats | q quit{}",
            if self.colored { Colors::DIM } else { "" },
            reset
        );
        println!();
    }

    fn print_status(&self, status: &str, message: &str) {
        if self.quiet_mode {
            return;
        }

        let (color, symbol) = match status {
            "CONNECTING" => (Colors::BRIGHT_YELLOW, "*"),
            "CONNECTED" => (Colors::BRIGHT_GREEN, "+"),
            "PAUSED" => (Colors::BRIGHT_BLUE, "="),
            "DISCONNECTED" => (Colors::BRIGHT_RED, "X"),
            "STOPPING" => (Colors::BRIGHT_MAGENTA, "!"),
            _ => (Colors::WHITE, "-"),
        };

        if self.colored {
            println!(
                "{}{}[{}]{} {} {}",
                Colors::BOLD,
                color,
                status,
                Colors::RESET,
                symbol,
                message
            );
        } else {
            println!("[{}] {} {}", status, symbol, message);
        }
    }

    fn print_error(&self, error_type: &str, message: &str) {
        if self.colored {
            eprintln!(
                "{}{}[{}]{} ! {}{}{}",
                Colors::BOLD,
                Colors::BRIGHT_RED,
                error_type,
                Colors::RESET,
                Colors::RED,
                message,
                Colors::RESET
            );
        } else {
            eprintln!("[{}] ! {}", error_type, message);
        }
    }
}

/// A line typed on stdin while the stream runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Pause,
    Resume,
    EventType(Option<String>),
    AddFilter(String, serde_json::Value),
    ClearFilters,
    ClearEvents,
    ShowStats,
    Quit,
}

impl Control {
    pub fn parse(line: &str) -> Result<Option<Self>, LiveEventsError> {
        let line = line.trim();
        let (cmd, arg) = match line.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (line, None),
        };

        let control = match cmd {
            "" => return Ok(None),
            "p" | "pause" => Control::Pause,
            "r" | "resume" => Control::Resume,
            "e" | "event" => Control::EventType(arg.map(str::to_string)),
            "f" | "filter" => match arg {
                Some(expr) => {
                    let (key, value) = ClientSideFilters::parse_pair(expr)?;
                    Control::AddFilter(key, value)
                }
                None => Control::ClearFilters,
            },
            "c" | "clear" => Control::ClearEvents,
            "s" | "stats" => Control::ShowStats,
            "q" | "quit" => Control::Quit,
            other => {
                return Err(LiveEventsError::UnknownCommand(other.to_string()));
            }
        };
        Ok(Some(control))
    }
}

/// Read stdin on a plain thread; a blocking read there never holds up
/// runtime shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read controls from stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Apply control lines until the input ends or `q` is entered.
pub async fn run_controls(
    mut lines: mpsc::Receiver<String>,
    handle: LiveEventsHandle,
    colored: bool,
) {
    let formatter = EventFormatter::new(OutputFormat::Minimal, colored, false);
    let mut client_filters = handle.client_side_filters().await;

    while let Some(line) = lines.recv().await {
        let control = match Control::parse(&line) {
            Ok(Some(control)) => control,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        let applied = match control {
            Control::Pause => handle.pause_stream().await,
            Control::Resume => handle.resume_stream().await,
            Control::EventType(Some(event_type)) => {
                handle.set_filters(FilterUpdate::event_type(event_type)).await
            }
            Control::EventType(None) => handle.set_filters(FilterUpdate::clear_event_type()).await,
            Control::AddFilter(key, value) => {
                client_filters.insert(key, value);
                handle.set_client_side_filters(client_filters.clone()).await
            }
            Control::ClearFilters => {
                client_filters = ClientSideFilters::new();
                handle.set_client_side_filters(client_filters.clone()).await
            }
            Control::ClearEvents => handle.clear_events().await,
            Control::ShowStats => {
                let stats = handle.stats().await;
                println!("{}", formatter.render_stats(&stats));
                let buffered = handle.event_count().await;
                let showing = handle.filtered_events().await.len();
                let properties = handle.current_event_properties().await.join(", ");
                println!(
                    "buffered: {} | showing: {} | properties: {}",
                    buffered, showing, properties
                );
                if tracing::enabled!(tracing::Level::DEBUG) {
                    let health = handle.health().await.to_json();
                    debug!(health = %health, "Health snapshot");
                }
                Ok(())
            }
            Control::Quit => {
                let _ = handle.shutdown().await;
                break;
            }
        };

        if let Err(e) = applied {
            warn!("Control could not be applied: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_controls() {
        assert_eq!(Control::parse("p").unwrap(), Some(Control::Pause));
        assert_eq!(Control::parse(" resume ").unwrap(), Some(Control::Resume));
        assert_eq!(
            Control::parse("e $pageview").unwrap(),
            Some(Control::EventType(Some("$pageview".into())))
        );
        assert_eq!(Control::parse("e").unwrap(), Some(Control::EventType(None)));
        assert_eq!(
            Control::parse("f team_id=2").unwrap(),
            Some(Control::AddFilter("team_id".into(), json!(2)))
        );
        assert_eq!(Control::parse("f").unwrap(), Some(Control::ClearFilters));
        assert_eq!(Control::parse("").unwrap(), None);
        assert!(Control::parse("x").is_err());
        assert!(Control::parse("f broken").is_err());
    }
}
