use anyhow::{bail, Result};
use photosift_core::{AssetId, Decision, Engine, Error};

pub fn run(engine: &Engine, decision: Decision, ids: Vec<AssetId>) -> Result<()> {
    let (known, unknown) = partition_known(engine, ids)?;
    for id in &unknown {
        eprintln!("  not in catalog: {id}");
    }
    if known.is_empty() {
        bail!("no known assets to mark");
    }

    engine.apply_decision(&known, decision)?;
    println!(
        "Marked {} asset{} as {}.",
        known.len(),
        if known.len() == 1 { "" } else { "s" },
        decision
    );
    Ok(())
}

fn partition_known(engine: &Engine, ids: Vec<AssetId>) -> Result<(Vec<AssetId>, Vec<AssetId>)> {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for id in ids {
        match engine.asset(&id) {
            Ok(_) => known.push(id),
            Err(Error::AssetNotFound(_)) => unknown.push(id),
            Err(e) => return Err(e.into()),
        }
    }
    Ok((known, unknown))
}
