use anyhow::Result;
use photosift_core::{Engine, FeedItem, FeedStatus, GroupKey, GroupedKind, QueryIntent};

use super::status::format_size;

pub fn run(engine: &Engine, id: Option<String>) -> Result<()> {
    match id {
        Some(id) => show_group(engine, &id),
        None => list_groups(engine),
    }
}

fn list_groups(engine: &Engine) -> Result<()> {
    let intent = QueryIntent::Grouped(GroupedKind::Similar);
    let mut state = engine.ensure_feed(intent)?;
    while state.status == FeedStatus::Streaming {
        state = engine.request_next_page(intent)?;
    }

    if state.items.is_empty() {
        println!("No similar photos found. Run `photosift scan <dir>` first.");
        return Ok(());
    }

    println!(
        "{:<38} {:<11} {:<8} {}",
        "ID", "Confidence", "Members", "Cover"
    );
    println!("{}", "-".repeat(80));

    for group in state.items.iter().filter_map(FeedItem::as_group) {
        let GroupKey::Similarity(id) = &group.key else {
            continue;
        };
        let cover = group
            .cover
            .as_ref()
            .and_then(|c| group.members.iter().find(|m| &m.id == c))
            .map(|m| m.file_name.clone())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "{:<38} {:<11.2} {:<8} {}",
            id,
            group.confidence,
            group.members.len(),
            cover,
        );
    }

    Ok(())
}

fn show_group(engine: &Engine, id: &str) -> Result<()> {
    let group = engine.group_view(id)?;

    println!("Group {} ({:.2})", id, group.confidence);
    println!("{}", "-".repeat(60));

    for member in &group.members {
        let marker = if group.cover.as_deref() == Some(member.id.as_str()) {
            " [COVER]"
        } else {
            ""
        };
        println!(
            "  {} ({}, {}, score {:.2}){}",
            member.id,
            member.capture_date.format("%Y-%m-%d %H:%M:%S"),
            format_size(member.byte_size),
            member.similarity_score,
            marker,
        );
    }

    Ok(())
}
