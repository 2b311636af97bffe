use anyhow::Result;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use photosift_core::{Engine, MonthBucket};

use super::status::format_size;

pub fn run(engine: &Engine) -> Result<()> {
    let buckets = engine.timeline_buckets()?;

    if buckets.is_empty() {
        println!("Nothing indexed yet. Run `photosift scan <dir>` first.");
        return Ok(());
    }

    println!();
    println!("  Timeline");
    println!("  --------");
    println!("{}", bucket_table(&buckets));
    println!();
    Ok(())
}

pub(crate) fn bucket_table(buckets: &[MonthBucket]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Month"),
        Cell::new("Assets"),
        Cell::new("Delete"),
        Cell::new("Blurred"),
        Cell::new("Docs"),
        Cell::new("Size"),
        Cell::new("Cover"),
    ]);
    for b in buckets {
        table.add_row(vec![
            Cell::new(b.month),
            Cell::new(b.asset_count),
            Cell::new(b.pending_count),
            Cell::new(b.blurred_count),
            Cell::new(b.document_count),
            Cell::new(format_size(b.total_bytes)),
            Cell::new(b.cover.as_deref().unwrap_or("-")),
        ]);
    }
    table
}
