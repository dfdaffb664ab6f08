//! Model catalog listing — `chatchain models`.

use anyhow::Result;
use console::style;

use super::super::Cli;

pub fn cmd_models(cli: &Cli) -> Result<()> {
    use chatchain::backend::{BackendRegistry, ModelCatalog};
    use chatchain::config::MODEL_CATALOG_FILE;

    let catalog_file = cli.company_root.join(MODEL_CATALOG_FILE);
    let catalog = ModelCatalog::load_or_default(&catalog_file)?;
    let registry = BackendRegistry::default();

    if catalog_file.exists() {
        println!("Catalog: built-in + {}", catalog_file.display());
    } else {
        println!("Catalog: built-in");
    }

    for (name, platform) in &catalog.platforms {
        println!();
        println!("{}", style(name).bold());
        if !platform.base_url.is_empty() {
            println!("  base_url: {}", platform.base_url);
        }
        let styles: Vec<String> = platform
            .api_types
            .iter()
            .map(|api| {
                if registry.supports(name, api) {
                    api.clone()
                } else {
                    format!("{} (no backend)", api)
                }
            })
            .collect();
        println!("  api types: {}", styles.join(", "));
        for model in &platform.models {
            println!("  - {} ({} tokens)", model.name, model.num_tokens);
        }
    }

    Ok(())
}
