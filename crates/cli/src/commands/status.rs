use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use photosift_core::{AssetTags, DashboardSnapshot, Decision, Engine};

pub fn run(engine: &Engine) -> Result<()> {
    let snapshot = engine.dashboard_snapshot()?;

    println!();
    println!("  Photosift Status");
    println!("  ================");
    println!();
    println!("  Overview");
    println!("  --------");
    println!(
        "   Assets:     {:>8}        Disk Usage:  {}",
        snapshot.total_count,
        format_size(snapshot.total_bytes)
    );
    println!(
        "   Photos:     {:>8}        Videos:      {:>8}",
        snapshot.photo_count, snapshot.video_count
    );
    println!(
        "   Analyzed:   {:>8}        Pending:     {}",
        snapshot.analyzed_count,
        analysis_progress(&snapshot)
    );
    println!(
        "   Groups:     {:>8}        Reclaimable: {}",
        snapshot.similar_group_count,
        format_size(snapshot.reclaimable_similar_bytes)
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![Cell::new("Category"), Cell::new("Assets")]);
    for (label, count) in categories(&snapshot) {
        table.add_row(vec![Cell::new(label), Cell::new(count)]);
    }

    println!();
    println!("  Categories");
    println!("  ----------");
    println!("{table}");
    println!();
    println!(
        "  Marked for deletion: {} ({})",
        snapshot.pending_deletion_count,
        format_size(snapshot.pending_deletion_bytes)
    );
    if let Some(at) = engine.last_reload()? {
        println!("  Last scan: {at}");
    }
    if let Some(path) = &engine.config().catalog_path {
        println!("  Catalog:   {}", path.display());
    }
    println!();
    println!("  Run 'photosift feed <intent>' to browse a category.");
    println!();

    Ok(())
}

fn categories(s: &DashboardSnapshot) -> Vec<(&'static str, usize)> {
    vec![
        ("Similar", s.similar_asset_count),
        ("Blurred", s.blurred_count),
        ("Documents", s.document_count),
        ("Text-heavy", s.text_heavy_count),
        ("Screenshots", s.screenshot_count),
        ("Large files", s.large_file_count),
        ("Skipped", s.skipped_count),
    ]
}

/// Photos still waiting for analysis, as text.
fn analysis_progress(s: &DashboardSnapshot) -> String {
    let waiting = s.photo_count.saturating_sub(s.analyzed_count);
    if waiting == 0 {
        "none".to_string()
    } else {
        format!("{waiting} to analyze")
    }
}

pub(crate) fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    match bytes {
        b if b >= GB => format!("{:.1} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{} B", b),
    }
}

/// Comma-separated tag names, `-` when none are set.
pub(crate) fn tags_label(tags: AssetTags) -> String {
    let names: Vec<&str> = [
        (AssetTags::BLURRED, "blurred"),
        (AssetTags::DOCUMENT, "document"),
        (AssetTags::TEXT_HEAVY, "text"),
        (AssetTags::SCREENSHOT, "screenshot"),
        (AssetTags::LARGE_FILE, "large"),
    ]
    .into_iter()
    .filter(|(tag, _)| tags.contains(*tag))
    .map(|(_, name)| name)
    .collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}

pub(crate) fn decision_label(decision: Decision) -> &'static str {
    match decision {
        Decision::Clean => "",
        Decision::PendingDeletion => "delete",
        Decision::Skipped => "skip",
    }
}
