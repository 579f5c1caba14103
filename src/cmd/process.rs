//! `recast processes` and `recast bundles`.

use std::path::Path;

use anyhow::Result;

use super::client::Client;

pub async fn cmd_processes(project_dir: &Path, verbose: bool) -> Result<()> {
    let client = Client::signed_in(project_dir, verbose).await?;
    let facades = &client.facades;
    let processes = facades.processes.all();

    if processes.is_empty() {
        println!("No processes found.");
        println!("Import one with 'recast bundle import <file>'.");
        return Ok(());
    }

    println!();
    for process in processes {
        let id = process.id.unwrap_or_default();
        let elements = facades.elements.by_process_id(id).len();
        println!(
            "{} {} {}",
            console::style(format!("#{}", id)).dim(),
            console::style(&process.name).bold(),
            console::style(format!("({} elements)", elements)).dim()
        );
        for step in facades.steps.by_process_id(id) {
            let seq = step
                .seq_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("  {:>3}. {}", seq, step.name);
            for prop in facades.step_properties.by_step_id(step.id.unwrap_or_default()) {
                println!(
                    "         {} {}",
                    prop.name,
                    console::style(format!("[{}]", prop.kind)).dim()
                );
            }
        }
        println!();
    }
    Ok(())
}

pub async fn cmd_bundles(project_dir: &Path, verbose: bool) -> Result<()> {
    let client = Client::signed_in(project_dir, verbose).await?;
    let bundles = client.facades.bundles.all();

    if bundles.is_empty() {
        println!("No bundles found.");
        return Ok(());
    }

    println!();
    for bundle in bundles {
        let id = bundle.id.unwrap_or_default();
        let processes = client.facades.processes.by_bundle_id(id);
        println!(
            "{} {}",
            console::style(format!("#{}", id)).dim(),
            console::style(&bundle.name).bold()
        );
        for process in processes {
            println!("  - {}", process.name);
        }
    }
    println!();
    Ok(())
}
