use anyhow::{Context, Result, bail};
use clap::Args;
use folio_client::Credentials;

use super::{Ctx, table};

#[derive(Args)]
pub struct LoginArgs {
    /// Account email
    #[arg(long)]
    pub email: String,

    /// Password (default: $FOLIO_PASSWORD, then one line from stdin)
    #[arg(long)]
    pub password: Option<String>,
}

fn read_password(args: &LoginArgs) -> Result<String> {
    if let Some(password) = &args.password {
        return Ok(password.clone());
    }
    if let Ok(password) = std::env::var("FOLIO_PASSWORD") {
        return Ok(password);
    }
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("No password given (use --password, FOLIO_PASSWORD or stdin)");
    }
    Ok(password)
}

pub async fn login(args: LoginArgs, ctx: &Ctx) -> Result<()> {
    let credentials = Credentials {
        email: args.email.clone(),
        password: read_password(&args)?,
    };

    let spinner = ctx.progress.spinner("login");
    spinner.set_message(args.email.clone());
    let result = ctx.manager.login(&credentials).await;
    spinner.finish_and_clear();

    let session = result.with_context(|| format!("Login failed for {}", args.email))?;
    let name = session
        .user
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or(&args.email);
    ctx.progress.println(format!("Logged in as {name}"));
    Ok(())
}

pub async fn logout(ctx: &Ctx) -> Result<()> {
    if ctx.manager.session().is_empty() {
        ctx.progress.println("Not logged in");
        return Ok(());
    }
    ctx.manager.logout().await;
    ctx.progress.println("Logged out");
    Ok(())
}

pub async fn whoami(ctx: &Ctx) -> Result<()> {
    if !ctx.manager.ensure_session().await {
        bail!("Not logged in (run `folio login --email <EMAIL>`)");
    }
    ctx.manager
        .verify()
        .await
        .context("Session could not be verified")?;

    let session = ctx.manager.session();
    let mut table = table(&["Field", "Value"]);
    if let Some(user) = &session.user {
        table.add_row(vec!["ID", &user.id.to_string()]);
        table.add_row(vec!["Username", &user.username]);
        table.add_row(vec!["Email", &user.email]);
        table.add_row(vec![
            "Verified",
            if user.email_verified { "yes" } else { "no" },
        ]);
        if !user.roles.is_empty() {
            table.add_row(vec!["Roles", &user.roles]);
        }
    }
    table.add_row(vec!["State", &ctx.manager.state().to_string()]);

    eprintln!("\n{table}");
    Ok(())
}
