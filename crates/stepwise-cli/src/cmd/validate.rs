use crate::output::print_json;
use anyhow::Context;
use std::io::Read;
use std::path::Path;
use stepwise_core::orchestration::{validate_steps, DefinitionDraft, ValidationOutcome};

/// `.json` files parse as JSON; anything else, stdin included, as YAML.
fn parse_draft(path: &Path, raw: &str) -> anyhow::Result<DefinitionDraft> {
    let is_json = path.extension().is_some_and(|e| e == "json");
    if is_json {
        serde_json::from_str(raw).context("invalid JSON definition")
    } else {
        serde_yaml::from_str(raw).context("invalid YAML definition")
    }
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

pub fn run(path: &Path, json: bool) -> anyhow::Result<()> {
    let raw = read_input(path)?;
    let draft = parse_draft(path, &raw)?;
    let outcome: ValidationOutcome = validate_steps(&draft.steps).into();

    if json {
        print_json(&outcome)?;
    } else if outcome.is_valid {
        println!(
            "'{}' is valid ({} step{}).",
            draft.name,
            draft.steps.len(),
            if draft.steps.len() == 1 { "" } else { "s" }
        );
    } else if let Some(error) = &outcome.error {
        println!("'{}' is invalid: {error}", draft.name);
    }

    if !outcome.is_valid {
        anyhow::bail!("definition is invalid");
    }
    Ok(())
}
