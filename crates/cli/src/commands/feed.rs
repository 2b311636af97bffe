use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use photosift_core::{
    AssetRecord, Decision, Engine, FeedItem, FeedState, FeedStatus, GroupKey, GroupView,
    QueryIntent,
};

use super::status::{decision_label, format_size, tags_label};
use super::timeline::bucket_table;

/// Load `pages` pages of `intent` and print them.
pub fn run(engine: &Engine, intent: QueryIntent, pages: usize) -> Result<()> {
    let mut state = engine.ensure_feed(intent)?;
    for _ in 1..pages.max(1) {
        if state.status != FeedStatus::Streaming {
            break;
        }
        state = engine.request_next_page(intent)?;
    }

    println!();
    println!("  {intent}");
    println!("  {}", "-".repeat(intent.to_string().len()));
    render(&state);
    println!();
    println!("  {}", footer(&state));
    println!();
    Ok(())
}

fn render(state: &FeedState) {
    let assets: Vec<&AssetRecord> = state.items.iter().filter_map(FeedItem::as_asset).collect();
    if !assets.is_empty() {
        println!("{}", asset_table(&assets));
    }

    for group in state.items.iter().filter_map(FeedItem::as_group) {
        print_group(group);
    }

    let buckets: Vec<_> = state
        .items
        .iter()
        .filter_map(|i| match i {
            FeedItem::Bucket(b) => Some(b.clone()),
            _ => None,
        })
        .collect();
    if !buckets.is_empty() {
        println!("{}", bucket_table(&buckets));
    }

    for item in &state.items {
        if let FeedItem::Dashboard(s) = item {
            println!(
                "   {} assets, {} analyzed, {} similar groups, {} reclaimable",
                s.total_count,
                s.analyzed_count,
                s.similar_group_count,
                format_size(s.reclaimable_similar_bytes)
            );
        }
    }
}

fn asset_table(assets: &[&AssetRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID"),
        Cell::new("Captured"),
        Cell::new("Size"),
        Cell::new("Tags"),
        Cell::new("Blur"),
        Cell::new("Decision"),
    ]);
    for a in assets {
        let decision = Cell::new(decision_label(a.decision));
        let decision = match a.decision {
            Decision::PendingDeletion => decision.fg(Color::Red),
            Decision::Skipped => decision.fg(Color::DarkGrey),
            Decision::Clean => decision,
        };
        table.add_row(vec![
            Cell::new(&a.id),
            Cell::new(a.capture_date.format("%Y-%m-%d %H:%M")),
            Cell::new(format_size(a.byte_size)),
            Cell::new(tags_label(a.tags)),
            Cell::new(format!("{:.2}", a.blur_score)),
            decision,
        ]);
    }
    table
}

fn print_group(group: &GroupView) {
    let title = match &group.key {
        GroupKey::Similarity(id) => format!("Group {id} ({:.2})", group.confidence),
        GroupKey::Month(month) => format!("Skipped in {month}"),
    };
    println!("  {title}");
    for member in &group.members {
        let marker = if group.cover.as_ref() == Some(&member.id) {
            " [COVER]"
        } else {
            ""
        };
        println!(
            "    {} ({}){}",
            member.id,
            format_size(member.byte_size),
            marker
        );
    }
}

fn footer(state: &FeedState) -> String {
    match (state.status, state.cursor) {
        (FeedStatus::Streaming, Some(cursor)) => format!(
            "{} items shown, more from offset {} (use --pages)",
            state.items.len(),
            cursor.offset
        ),
        _ => format!("{} items", state.items.len()),
    }
}
