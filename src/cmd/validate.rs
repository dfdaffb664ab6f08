//! Configuration check — `chatchain validate`.

use anyhow::{Context, Result};
use console::style;

use super::super::Cli;
use chatchain::phase::{PhaseStep, PhaseType};
use chatchain::pipeline::CompositionGraph;

fn print_step(step: &PhaseStep, graph: &CompositionGraph, depth: usize) {
    let indent = "  ".repeat(depth + 1);
    match step.phase_type {
        PhaseType::Composed => {
            let Some(def) = graph.definition(&step.phase) else {
                return;
            };
            println!(
                "{}{} {} x{}",
                indent,
                style("composed").cyan(),
                step.phase,
                def.cycle_count
            );
            for child in &def.child_sequence {
                print_step(child, graph, depth + 1);
            }
        }
        _ => println!("{}{} {}", indent, style("simple").dim(), step.phase),
    }
}

pub fn cmd_validate(cli: &Cli, company: &str) -> Result<()> {
    use chatchain::config::CompanyConfig;
    use chatchain::logging;
    use chatchain::pipeline::{PhaseRegistry, ValidatedPipeline};

    let _guard = logging::init(cli.verbose, None)?;

    let company = CompanyConfig::resolve(&cli.company_root, company)?;
    let loaded = company.load()?;

    println!("Company: {}", company.company);
    for file in company.files() {
        println!("  {}", file.display());
    }

    let pipeline = ValidatedPipeline::validate(&loaded.chain, &loaded.phases, &PhaseRegistry::chatdev())
        .context("Pipeline validation failed")?;

    let mut warnings = loaded.chain.warnings();
    for name in loaded.phases.names() {
        let Some(def) = loaded.phases.get(name) else {
            continue;
        };
        for role in [&def.assistant_role, &def.user_role] {
            if !loaded.roles.contains(role) {
                warnings.push(format!("Phase '{}' uses role '{}' with no role prompt", name, role));
            }
        }
    }

    println!();
    println!("Pipeline:");
    for step in &pipeline.steps {
        print_step(step, &pipeline.graph, 0);
    }
    println!();
    println!(
        "Planned simple phase executions (no early breaks): {}",
        pipeline.planned_executions()
    );

    if warnings.is_empty() {
        println!("{}", style("Configuration is valid.").green());
    } else {
        println!();
        println!("{}", style("Warnings:").yellow());
        for warning in &warnings {
            println!("  - {}", warning);
        }
    }

    Ok(())
}
