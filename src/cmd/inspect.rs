use anyhow::{Result, bail};

use crate::store::ContentStore;

/// Print the metadata of the artifact named by an id or a stack ref.
pub fn run(store: &ContentStore, target: &str) -> Result<()> {
    let Some(artifact) = store.resolve(target)? else {
        bail!("no artifact matches `{target}` in {}", store.root().display());
    };
    println!("{}", serde_json::to_string_pretty(&artifact)?);
    Ok(())
}
