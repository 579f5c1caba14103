//! Element listing and editing commands.

use std::path::Path;

use anyhow::{Result, bail};
use dialoguer::Confirm;
use recast::view_model::{ElementViewModel, ViewValue};

use super::super::ElementCommands;
use super::client::Client;

pub async fn cmd_elements(project_dir: &Path, verbose: bool, process: Option<&str>) -> Result<()> {
    let client = Client::signed_in(project_dir, verbose).await?;
    let process_id = match process {
        Some(key) => client.resolve_process(key)?.id,
        None => None,
    };

    let view_models: Vec<ElementViewModel> = client
        .facades
        .view_models
        .view_models()
        .into_iter()
        .filter(|vm| process_id.is_none_or(|id| vm.element.process_id == id))
        .collect();

    if view_models.is_empty() {
        println!("No elements found.");
        return Ok(());
    }

    println!();
    for vm in &view_models {
        println!(
            "{} {:<24} {:<20} {}",
            console::style(format!("#{:<5}", vm.element.id.unwrap_or_default())).dim(),
            vm.element.name,
            vm.process.name,
            position(vm)
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_element(project_dir: &Path, verbose: bool, command: ElementCommands) -> Result<()> {
    let client = Client::signed_in(project_dir, verbose).await?;
    let facades = &client.facades;

    match command {
        ElementCommands::Show { id } => {
            let Some(vm) = facades.view_models.by_element_id(id) else {
                bail!("Element {} not found", id);
            };
            print_view_model(&vm);
        }
        ElementCommands::Create { process, name } => {
            let process = client.resolve_process(&process)?;
            let element = facades
                .elements
                .create_element(process.id.unwrap_or_default(), &name)
                .await?;
            println!(
                "{} element '{}' (#{}) in {}",
                console::style("Created").green(),
                element.name,
                element.id.unwrap_or_default(),
                process.name
            );
        }
        ElementCommands::Advance { id } => {
            let before = facades.elements.by_id(id);
            let element = facades.elements.advance(id).await?;
            if before.as_ref().is_some_and(|e| e.is_finished()) {
                println!("Element '{}' is already finished.", element.name);
                return Ok(());
            }
            match element.current_step_id.and_then(|s| facades.steps.by_id(s)) {
                Some(step) => println!("Element '{}' moved to step '{}'", element.name, step.name),
                None => println!(
                    "Element '{}' {}",
                    element.name,
                    console::style("finished").green()
                ),
            }
        }
        ElementCommands::Set {
            id,
            property,
            value,
        } => {
            let Some(mut vm) = facades.view_models.by_element_id(id) else {
                bail!("Element {} not found", id);
            };
            let Some(prop) = vm.properties.iter_mut().find(|p| p.step_prop_id == property) else {
                bail!(
                    "Step property {} does not belong to the process of element {}",
                    property,
                    id
                );
            };
            prop.value = Some(value.clone());
            let label = prop.label.clone();
            facades.view_models.save_from_view_model(&vm).await?;
            println!("Set '{}' = '{}' on element '{}'", label, value, vm.element.name);
        }
        ElementCommands::Delete { id, force } => {
            let Some(vm) = facades.view_models.by_element_id(id) else {
                println!("Element {} not found.", id);
                return Ok(());
            };

            if !force {
                let confirm = Confirm::new()
                    .with_prompt(format!("Delete element '{}'?", vm.element.name))
                    .default(false)
                    .interact()
                    .unwrap_or(false);

                if !confirm {
                    println!("Deletion cancelled.");
                    return Ok(());
                }
            }

            facades.view_models.delete_element(id).await?;
            println!("Deleted element '{}'", vm.element.name);
        }
    }

    Ok(())
}

/// Current step as "name (n/total)", or "finished".
pub(crate) fn position(vm: &ElementViewModel) -> String {
    match &vm.current_step {
        Some(step) => {
            let index = vm
                .sorted_steps
                .iter()
                .position(|s| s.id == step.id)
                .map(|i| i + 1)
                .unwrap_or_default();
            format!("{} ({}/{})", step.name, index, vm.sorted_steps.len())
        }
        None => console::style("finished").green().to_string(),
    }
}

fn print_view_model(vm: &ElementViewModel) {
    println!();
    println!(
        "{} {}",
        console::style(&vm.element.name).bold().cyan(),
        console::style(format!("#{}", vm.element.id.unwrap_or_default())).dim()
    );
    println!("  process  {}", vm.process.name);
    println!("  step     {}", position(vm));
    if !vm.storage_backends.is_empty() {
        let backends: Vec<String> = vm.storage_backends.iter().map(|b| b.to_string()).collect();
        println!("  storage  {}", backends.join(", "));
    }
    println!();

    for step in &vm.sorted_steps {
        let props: Vec<_> = vm
            .properties
            .iter()
            .filter(|p| Some(p.step_id) == step.id)
            .collect();
        if props.is_empty() {
            continue;
        }
        println!("  {}", console::style(&step.name).bold());
        for prop in props {
            let value = match &prop.value {
                Some(v) => v.clone(),
                None => match &prop.default_value {
                    ViewValue::Bool(b) => console::style(b.to_string()).dim().to_string(),
                    ViewValue::Text(t) if t.is_empty() => console::style("-").dim().to_string(),
                    ViewValue::Text(t) => console::style(t.clone()).dim().to_string(),
                },
            };
            println!(
                "    {:<4} {:<24} {} {}",
                prop.step_prop_id,
                prop.label,
                value,
                console::style(format!("[{}]", prop.kind)).dim()
            );
        }
    }
    println!();
}
