use serde::Serialize;
use tabled::Tabled;

/// Output format for listing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_str_arg(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

/// Format `items` as a rounded table or a pretty JSON array.
pub fn format_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                "(none)".to_string()
            } else {
                tabled::Table::new(items)
                    .with(tabled::settings::Style::rounded())
                    .to_string()
            }
        }
        OutputFormat::Json => serde_json::to_string_pretty(items).unwrap_or_default(),
    }
}

pub fn render_list<T: Serialize + Tabled>(items: &[T], format: OutputFormat) {
    println!("{}", format_list(items, format));
}
