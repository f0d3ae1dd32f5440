//! Rule inspection command: `shadowbox rules`.

use std::path::Path;

use anyhow::Result;
use shadowbox::shadow::RuleSet;

/// Print the sync rules for `repo`, or the verdict for each `check` path.
pub fn cmd_rules(repo: &Path, check: &[String]) -> Result<()> {
    if !repo.is_dir() {
        anyhow::bail!("Repository path {} does not exist", repo.display());
    }
    let rules = RuleSet::for_repo(repo);

    if check.is_empty() {
        print!("{}", rules.to_filter_rules());
        return Ok(());
    }
    for path in check {
        let is_dir = path.ends_with('/') || repo.join(path).is_dir();
        let verdict = if rules.is_excluded(path, is_dir) {
            "exclude"
        } else {
            "include"
        };
        println!("{verdict}\t{path}");
    }
    Ok(())
}
