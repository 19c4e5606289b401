use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use careline_core::{TimelineConfig, TimelineEntry, TimelineError};
use careline_hms::{build_patient_timeline, RowQuery, RowStore, TimelineRequest};
use clap::Parser;
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(
    name = "careline-cli",
    about = "Dựng dòng thời gian bệnh nhân từ một file JSON chứa các bảng dữ liệu."
)]
struct Args {
    /// Đường dẫn tới file JSON: một object ánh xạ tên bảng sang mảng dòng.
    #[arg(short, long)]
    input: PathBuf,

    /// Khoá chính của bệnh nhân trong kho dữ liệu.
    #[arg(short, long)]
    patient: String,

    /// Mã bệnh nhân hiển thị, chỉ dùng để dựng đường dẫn.
    #[arg(short, long, default_value = "UNKNOWN")]
    display_id: String,

    /// Độ lệch múi giờ hiển thị tính bằng phút.
    #[arg(long, default_value_t = 330)]
    offset_minutes: i32,
}

/// Kho dữ liệu trong bộ nhớ đọc từ file fixture.
struct FixtureStore {
    tables: HashMap<String, Vec<Value>>,
}

#[async_trait]
impl RowStore for FixtureStore {
    async fn select(&self, query: RowQuery<'_>) -> Result<Vec<Value>, TimelineError> {
        let rows = self.tables.get(query.table).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|row| {
                row.get(query.key_column)
                    .map(|value| match value {
                        Value::String(raw) => raw.clone(),
                        other => other.to_string(),
                    })
                    .is_some_and(|key| query.keys.contains(&key))
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let data = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Không đọc được file {:?}", args.input))?;
    let tables: HashMap<String, Vec<Value>> =
        serde_json::from_str(&data).context("File fixture không đúng định dạng bảng -> dòng")?;

    let config = TimelineConfig {
        display_offset_minutes: args.offset_minutes,
        ..TimelineConfig::default()
    };
    let store = Arc::new(FixtureStore { tables });
    let request = TimelineRequest::new(args.patient, args.display_id);
    let snapshot = build_patient_timeline(store, request, config.clone()).await;

    if snapshot.all_sources_failed() {
        println!("Không tải được lịch sử bệnh nhân.");
        return Ok(());
    }

    println!(
        "Generated at: {}\nEvents: {}\nFailed sources: {}",
        snapshot.generated_at,
        snapshot.events.len(),
        snapshot.failed_sources.len()
    );

    for bucket in snapshot.day_view(&config) {
        println!("\n== {} ==", bucket.day);
        for entry in &bucket.entries {
            match entry {
                TimelineEntry::Admission(group) => {
                    println!(
                        "  [+] {} ({} sự kiện trong đợt)",
                        group.anchor.title,
                        group.count()
                    );
                    for child in &group.children {
                        println!("      - {}", describe(child));
                    }
                }
                TimelineEntry::Single(event) => println!("  - {}", describe(event)),
            }
        }
    }

    Ok(())
}

fn describe(event: &careline_core::TimelineEvent) -> String {
    let mut line = format!("{} | {}", event.occurred_at.format("%H:%M"), event.title);
    if let Some(subtitle) = &event.subtitle {
        line.push_str(&format!(" | {subtitle}"));
    }
    if let Some(amount) = event.amount {
        line.push_str(&format!(" ({amount:.2})"));
    }
    if let Some(status) = &event.status {
        line.push_str(&format!(" [{status}]"));
    }
    line
}
