//! `recast watch`: keep the caches live and print element movements.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use recast::view_model::ElementViewModel;

use super::client::Client;
use super::element::position;

pub async fn cmd_watch(project_dir: &Path, verbose: bool, process: Option<&str>) -> Result<()> {
    let mut client = Client::signed_in(project_dir, verbose).await?;
    let process_id = match process {
        Some(key) => client.resolve_process(key)?.id,
        None => None,
    };

    let refresh = client.session.spawn_refresh();
    client.facades.start(client.session.sessions());
    let mut view_models = client.facades.view_models.subscribe();

    println!(
        "{} {}",
        console::style("Watching elements").bold().cyan(),
        console::style("(Ctrl-C to stop)").dim()
    );

    let mut seen: HashMap<i64, String> = HashMap::new();
    report(&view_models.borrow_and_update(), process_id, &mut seen);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view_models.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view_models.borrow_and_update().clone();
                report(&current, process_id, &mut seen);
            }
        }
    }

    refresh.abort();
    client.facades.shutdown();
    println!();
    println!("Stopped.");
    Ok(())
}

/// Print elements that appeared, moved or disappeared since the last report.
fn report(view_models: &[ElementViewModel], process_id: Option<i64>, seen: &mut HashMap<i64, String>) {
    let mut current = HashMap::new();
    for vm in view_models
        .iter()
        .filter(|vm| process_id.is_none_or(|id| vm.element.process_id == id))
    {
        let Some(id) = vm.element.id else { continue };
        let at = position(vm);
        match seen.get(&id) {
            None => println!("  {} {} at {}", console::style("+").green(), vm.element.name, at),
            Some(previous) if *previous != at => {
                println!("  {} {} -> {}", console::style("~").yellow(), vm.element.name, at)
            }
            Some(_) => {}
        }
        current.insert(id, at);
    }
    for id in seen.keys() {
        if !current.contains_key(id) {
            println!("  {} element #{}", console::style("-").red(), id);
        }
    }
    *seen = current;
}
