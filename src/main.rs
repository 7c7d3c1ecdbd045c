use anyhow::{Context, bail};
use chrono::{Datelike, Duration, Local};
use dotenv::dotenv;
use log::{LevelFilter, info, warn};
use netschool::{SessionClient, check_host, config::PortalConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .init();

    let config = PortalConfig::new()?;
    if !check_host(&config.host, &config.client)
        .await
        .with_context(|| format!("could not reach {}", config.host))?
    {
        bail!("{} does not look like a school portal", config.host);
    }

    let mut client = SessionClient::new(&config)?;
    client.login().await.context("login failed")?;

    if let Some(profile) = client.profile() {
        info!("logged in as {} {}", profile.first_name, profile.last_name);
    }
    if let Some(context) = client.context() {
        println!("{}", serde_json::to_string_pretty(context)?);
    }

    let today = Local::now().date_naive();
    let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    let week_end = week_start + Duration::days(6);
    match client.diary(week_start, week_end).await {
        Ok(days) => println!("{}", serde_json::to_string_pretty(&days)?),
        Err(error) => warn!("could not load the diary: {error}"),
    }

    client.logout().await.context("logout failed")?;
    Ok(())
}
