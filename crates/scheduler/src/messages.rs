use reading::{Currency, Reading};

fn values_block(reading: &Reading) -> String {
    Currency::ALL
        .iter()
        .filter_map(|c| reading.values.get(c).map(|v| format!("{c}: {v}")))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn startup(last_known: Option<&Reading>) -> String {
    match last_known {
        Some(reading) => format!(
            "🚀 Rate watcher started.\nLast known reading ({}):\n{}",
            reading.date_of_record,
            values_block(reading)
        ),
        None => "🚀 Rate watcher started.\nNo previous reading on record.".to_string(),
    }
}

pub fn new_reading(reading: &Reading, early: bool) -> String {
    let headline = if early {
        "⚡ New reading published EARLY, before the expected window"
    } else {
        "✅ New reading published"
    };
    format!(
        "{headline}\nDate of record: {}\n{}",
        reading.date_of_record,
        values_block(reading)
    )
}

pub fn no_change(context: &str, last_known: Option<&Reading>) -> String {
    match last_known {
        Some(reading) => format!(
            "⏱ {context}\nNo new reading yet. Current {}: {} ({})",
            Currency::PRIMARY,
            reading.primary(),
            reading.date_of_record
        ),
        None => format!("⏱ {context}\nNo reading available yet."),
    }
}

pub fn failure(detail: &str) -> String {
    format!("⚠️ Rate watcher problem: {detail}\nFurther failures are muted for a while.")
}

pub fn shutdown(last_known: Option<&Reading>) -> String {
    match last_known {
        Some(reading) => format!(
            "🛑 Rate watcher stopping. Last known {}: {} ({})",
            Currency::PRIMARY,
            reading.primary(),
            reading.date_of_record
        ),
        None => "🛑 Rate watcher stopping.".to_string(),
    }
}
