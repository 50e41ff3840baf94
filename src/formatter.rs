use crate::types::{LiveEvent, Stats};

// ANSI color codes
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";

    pub const RED: &'static str = "\x1b[31m";
    pub const WHITE: &'static str = "\x1b[37m";
    pub const GRAY: &'static str = "\x1b[90m";

    pub const BRIGHT_RED: &'static str = "\x1b[91m";
    pub const BRIGHT_GREEN: &'static str = "\x1b[92m";
    pub const BRIGHT_YELLOW: &'static str = "\x1b[93m";
    pub const BRIGHT_BLUE: &'static str = "\x1b[94m";
    pub const BRIGHT_MAGENTA: &'static str = "\x1b[95m";
    pub const BRIGHT_CYAN: &'static str = "\x1b[96m";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
    Minimal,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "csv" => OutputFormat::Csv,
            "json" => OutputFormat::Json,
            "minimal" => OutputFormat::Minimal,
            _ => OutputFormat::Table,
        }
    }
}

const EVENT_WIDTH: usize = 28;
const PERSON_WIDTH: usize = 24;

pub struct EventFormatter {
    format: OutputFormat,
    colored: bool,
    quiet: bool,
    event_count: u64,
}

impl EventFormatter {
    pub fn new(format: OutputFormat, colored: bool, quiet: bool) -> Self {
        Self {
            format,
            colored,
            quiet,
            event_count: 0,
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn print_header(&self) {
        if let Some(header) = self.header() {
            println!("{}", header);
        }
    }

    pub fn header(&self) -> Option<String> {
        if self.quiet {
            return None;
        }
        match self.format {
            OutputFormat::Table => Some(self.table_header()),
            OutputFormat::Csv => Some("count,event,distinct_id,timestamp,uuid".to_string()),
            OutputFormat::Json | OutputFormat::Minimal => None,
        }
    }

    pub fn print_event(&mut self, event: &LiveEvent) {
        let row = self.render_event(event);
        println!("{}", row);
    }

    pub fn render_event(&mut self, event: &LiveEvent) -> String {
        self.event_count += 1;
        match self.format {
            OutputFormat::Table => self.table_row(event),
            OutputFormat::Csv => self.csv_row(event),
            OutputFormat::Json => self.json_row(event),
            OutputFormat::Minimal => self.minimal_row(event),
        }
    }

    pub fn render_stats(&self, stats: &Stats) -> String {
        let users = stats
            .users_on_product
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        if self.colored {
            format!(
                "{}{}[STATS]{} users on product: {}{}{}",
                Colors::BOLD,
                Colors::BRIGHT_BLUE,
                Colors::RESET,
                Colors::BRIGHT_YELLOW,
                users,
                Colors::RESET
            )
        } else {
            format!("[STATS] users on product: {}", users)
        }
    }

    fn table_header(&self) -> String {
        let labels = format!(
            "│ {:<7} │ {:<ew$} │ {:<pw$} │ {:<8} │",
            "COUNT",
            "EVENT",
            "DISTINCT ID",
            "TIME",
            ew = EVENT_WIDTH,
            pw = PERSON_WIDTH
        );
        if self.colored {
            format!("{}{}{}{}", Colors::BOLD, Colors::GRAY, labels, Colors::RESET)
        } else {
            labels
        }
    }

    fn table_row(&self, event: &LiveEvent) -> String {
        let (accent, gray, reset) = if self.colored {
            (event_color(&event.event), Colors::GRAY, Colors::RESET)
        } else {
            ("", "", "")
        };

        format!(
            "{gray}│{reset} {:<7} {gray}│{reset} {accent}{:<ew$}{reset} {gray}│{reset} {:<pw$} {gray}│{reset} {:<8} {gray}│{reset}",
            self.event_count,
            truncate(&event.event, EVENT_WIDTH),
            truncate(&event.field_text("distinct_id").unwrap_or_else(|| "-".into()), PERSON_WIDTH),
            local_time(event, "%H:%M:%S"),
            ew = EVENT_WIDTH,
            pw = PERSON_WIDTH,
        )
    }

    fn csv_row(&self, event: &LiveEvent) -> String {
        format!(
            "{},{},{},{},{}",
            self.event_count,
            csv_field(&event.event),
            csv_field(&event.field_text("distinct_id").unwrap_or_default()),
            event.timestamp().unwrap_or(""),
            event.uuid().unwrap_or("")
        )
    }

    fn json_row(&self, event: &LiveEvent) -> String {
        serde_json::to_string(event).unwrap_or_else(|_| format!("{{\"event\":{:?}}}", event.event))
    }

    fn minimal_row(&self, event: &LiveEvent) -> String {
        format!(
            "{} {} {}",
            local_time(event, "%H:%M:%S"),
            event.event,
            event.field_text("distinct_id").as_deref().unwrap_or("-")
        )
    }
}

fn event_color(name: &str) -> &'static str {
    match name {
        "$pageview" | "$screen" => Colors::BRIGHT_CYAN,
        "$autocapture" => Colors::BRIGHT_MAGENTA,
        "$exception" => Colors::BRIGHT_RED,
        n if n.starts_with('$') => Colors::BRIGHT_BLUE,
        _ => Colors::BRIGHT_GREEN,
    }
}

fn local_time(event: &LiveEvent, fmt: &str) -> String {
    event
        .datetime_local()
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut out: String = value.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
