//! Sign-in, sign-out and profile commands.

use std::path::Path;

use anyhow::Result;
use dialoguer::{Input, Password};

use super::client::Client;

pub async fn cmd_login(project_dir: &Path, verbose: bool, oauth: bool, email: Option<&str>) -> Result<()> {
    let client = Client::connect(project_dir, verbose).await?;

    let session = if oauth {
        let auth = &client.config.toml.auth;
        let url = client.session.authorize_url(&auth.provider, &auth.redirect_url)?;

        println!();
        println!("Opening {} sign-in in your browser:", auth.provider);
        println!("  {}", url);
        if let Err(e) = open::that(&url) {
            eprintln!("Failed to open browser: {}", e);
        }
        println!();

        let redirect: String = Input::new()
            .with_prompt("Paste the URL your browser was redirected to")
            .interact_text()?;
        client.session.complete_redirect(redirect.trim()).await?
    } else {
        let email = match email {
            Some(email) => email.to_string(),
            None => Input::new().with_prompt("Email").interact_text()?,
        };
        let password = Password::new().with_prompt("Password").interact()?;
        client.session.sign_in_with_password(&email, &password).await?
    };

    let who = session
        .user
        .as_ref()
        .and_then(|u| u.email.clone())
        .or_else(|| session.user_id().map(|id| id.to_string()))
        .unwrap_or_else(|| "unknown user".to_string());
    println!("{} {}", console::style("Signed in as").green(), who);
    Ok(())
}

pub async fn cmd_logout(project_dir: &Path, verbose: bool) -> Result<()> {
    let client = Client::connect(project_dir, verbose).await?;
    if client.session.current().is_none() {
        println!("Not signed in.");
        return Ok(());
    }

    match client.session.sign_out().await {
        Ok(()) => println!("Signed out."),
        Err(e) => println!(
            "Signed out locally. {} {}",
            console::style("Server sign-out failed:").yellow(),
            e
        ),
    }

    // End the identity provider's own session too.
    if let Some(url) = &client.config.toml.auth.logout_url
        && let Err(e) = open::that(url)
    {
        eprintln!("Failed to open browser: {}", e);
        println!("Finish signing out at {}", url);
    }
    Ok(())
}

pub async fn cmd_profile(project_dir: &Path, verbose: bool) -> Result<()> {
    let client = Client::signed_in(project_dir, verbose).await?;
    let session = client.current_session()?;

    let Some(profile) = client.facades.profiles.current(session.user_id()) else {
        println!("No profile found for the signed-in user.");
        return Ok(());
    };

    println!();
    println!("{}", console::style("Profile").bold().cyan());
    println!("  id         {}", profile.id);
    if let Some(email) = session.user.as_ref().and_then(|u| u.email.as_deref()) {
        println!("  email      {}", email);
    }
    println!("  username   {}", profile.username.as_deref().unwrap_or("-"));
    println!("  full name  {}", profile.full_name.as_deref().unwrap_or("-"));
    if let Some(avatar) = &profile.avatar_url {
        println!("  avatar     {}", avatar);
    }
    if let Some(updated) = profile.updated_at {
        println!("  updated    {}", updated.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();
    Ok(())
}
