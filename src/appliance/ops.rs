//! Status and restore flows shared by every appliance type

use labdash_shared::{ResetOutcome, StatusRecord};
use tracing::{info, warn};

use super::driver::RestoreArgs;
use super::error::ApplianceError;
use super::lifecycle::Appliance;

/// Probe and parse restore status. The appliance must be connected.
pub async fn fetch_status(appliance: &mut Appliance) -> Result<StatusRecord, ApplianceError> {
    let driver = appliance.driver();
    let output = appliance.send_command(driver.status_command()).await?;
    let output = driver.answer_prompts(appliance, output).await?;
    Ok(driver.parse_status(appliance.host(), &output))
}

/// Issue a restore and watch it to a marker or the poll budget.
///
/// The outcome keeps "failed" and "stopped watching" apart: a failure marker
/// is [`RestoreOutcome::Failed`], an exhausted budget is
/// [`RestoreOutcome::Unknown`].
///
/// [`RestoreOutcome::Failed`]: labdash_shared::RestoreOutcome::Failed
/// [`RestoreOutcome::Unknown`]: labdash_shared::RestoreOutcome::Unknown
pub async fn restore(
    appliance: &mut Appliance,
    args: &RestoreArgs,
) -> Result<ResetOutcome, ApplianceError> {
    let driver = appliance.driver();
    let command = driver.restore_command(args)?;

    if let Some(outcome) = driver.pre_restore(appliance, args).await? {
        return Ok(outcome);
    }

    let shown = driver.restore_display(&command);
    info!(appliance = appliance.name(), command = %shown, "starting restore");
    let output = appliance.send_masked(&command, &shown).await?;
    let output = driver.answer_restore_prompts(appliance, output).await?;

    let markers = driver.markers().clone();
    let name = appliance.name().to_string();

    // The marker may already be in the command's own response
    if output.contains(&markers.failure) {
        warn!(appliance = %name, "restore rejected");
        return Ok(ResetOutcome::failed(name, output.trim()));
    }
    if output.contains(&markers.success) {
        return Ok(ResetOutcome::completed(name, "restore completed"));
    }

    let completion = appliance
        .wait_for_markers(&markers, driver.poll_budget())
        .await?;

    let outcome = if completion.success {
        info!(appliance = %name, "restore completed");
        ResetOutcome::completed(name, completion.message)
    } else if completion.timed_out {
        warn!(appliance = %name, budget = ?driver.poll_budget().total(), "restore outcome unknown");
        ResetOutcome::unknown(name, completion.message)
    } else {
        warn!(appliance = %name, "restore failed");
        ResetOutcome::failed(name, completion.message)
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appliance::dnac::DnacDriver;
    use crate::appliance::ise::{IseDriver, MISSING_BACKUP};
    use crate::appliance::testing::{appliance_with, fast_timing};
    use crate::appliance::vmanage::VmanageDriver;
    use crate::appliance::{DriverOverrides, TIMEOUT_UNKNOWN};
    use crate::transport::ScriptedConnector;
    use labdash_shared::RestoreOutcome;
    use std::sync::Arc;

    fn fast_overrides() -> DriverOverrides {
        DriverOverrides {
            poll_interval_secs: Some(0),
            max_polls: Some(4),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dnac_restore_answers_prompts_then_completes() {
        let connector = ScriptedConnector::new()
            .reply(
                "maglev restore apply b7c2",
                "[administration] username for 'https://kong-frontend:443': ",
            )
            .reply("admin", "[administration] password for 'admin': ")
            .reply_in_chunks(
                "Maglev123",
                ["Restore started\n", "Applying\n", "Restore completed successfully\n"],
            );
        let driver = Arc::new(DnacDriver::new(&fast_overrides()));
        let mut app = appliance_with(&connector, driver, "admin", "Maglev123").with_timing(fast_timing());

        let outcome = app
            .with_session(|a| {
                Box::pin(async move { restore(a, &RestoreArgs::BackupId("b7c2".into())).await })
            })
            .await
            .unwrap();

        assert!(outcome.reset);
        assert_eq!(outcome.outcome, RestoreOutcome::Completed);
        assert_eq!(outcome.target, "lab-appliance");
    }

    #[tokio::test]
    async fn test_vmanage_restore_failure_marker() {
        let connector = ScriptedConnector::new().reply_in_chunks(
            "request nms configuration-db restore path /home/admin/db.tar.gz",
            ["Restoring\n", "Failed to restore: checksum mismatch\n"],
        );
        let driver = Arc::new(VmanageDriver::new(&fast_overrides()));
        let mut app = appliance_with(&connector, driver, "admin", "pw").with_timing(fast_timing());

        let outcome = app
            .with_session(|a| {
                Box::pin(async move {
                    restore(a, &RestoreArgs::Path("/home/admin/db.tar.gz".into())).await
                })
            })
            .await
            .unwrap();

        assert!(!outcome.reset);
        assert_eq!(outcome.outcome, RestoreOutcome::Failed);
        assert_ne!(outcome.message, TIMEOUT_UNKNOWN);
        assert_eq!(connector.sent().first().map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_ise_restore_timeout_is_unknown() {
        let connector = ScriptedConnector::new()
            .reply("show repository labdash-ftp", "cfg.tar.gpg\n")
            .reply(
                "restore cfg.tar.gpg repository labdash-ftp encryption-key plain k3y",
                "% Restore in progress, this may take a while\n",
            );
        let driver = Arc::new(IseDriver::new(&fast_overrides()));
        let mut app = appliance_with(&connector, driver, "admin", "pw").with_timing(fast_timing());

        let args = RestoreArgs::File {
            file: "cfg.tar.gpg".into(),
            repository: "labdash-ftp".into(),
            key: "k3y".into(),
        };
        let outcome = app
            .with_session(|a| Box::pin(async move { restore(a, &args).await }))
            .await
            .unwrap();

        assert_eq!(outcome.outcome, RestoreOutcome::Unknown);
        assert!(!outcome.reset);
        assert_eq!(outcome.message, TIMEOUT_UNKNOWN);
    }

    #[tokio::test]
    async fn test_ise_missing_backup_skips_restore() {
        let connector =
            ScriptedConnector::new().reply("show repository labdash-ftp", "other.tar.gpg\n");
        let driver = Arc::new(IseDriver::new(&fast_overrides()));
        let mut app = appliance_with(&connector, driver, "admin", "pw").with_timing(fast_timing());

        let args = RestoreArgs::File {
            file: "cfg.tar.gpg".into(),
            repository: "labdash-ftp".into(),
            key: "k3y".into(),
        };
        let outcome = app
            .with_session(|a| Box::pin(async move { restore(a, &args).await }))
            .await
            .unwrap();

        assert_eq!(outcome.message, MISSING_BACKUP);
        assert!(!connector.sent().iter().any(|c| c.starts_with("restore ")));
    }

    #[tokio::test]
    async fn test_fetch_status_empty_history() {
        let connector = ScriptedConnector::new().reply("maglev restore history", "");
        let driver = Arc::new(DnacDriver::new(&DriverOverrides::default()));
        let mut app = appliance_with(&connector, driver, "admin", "pw").with_timing(fast_timing());

        let status = app
            .with_session(|a| Box::pin(fetch_status(a)))
            .await
            .unwrap();
        assert_eq!(status, StatusRecord::not_found("10.20.30.40"));
    }
}
