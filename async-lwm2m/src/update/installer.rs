// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::package::{ForcedError, PackageHeader};
use super::*;

/// What happened when a firmware upgrade was started.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// The device restarts into the new image, which reports success once
    /// running.
    Restart,
    /// The upgrade finished in place with the given success.
    Finished(bool),
    /// The device restarts, and the result is reported one scheduler tick
    /// after re-registering.
    Delayed(bool),
    /// The upgrade was postponed; the package stays downloaded.
    Deferred,
    /// The upgrade was accepted and will never report back.
    Pending,
    /// The upgrade could not start.
    Failed,
}

/// What happened when a software package was installed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Finished with the given success.
    Done(bool),
    /// Finishes with the given success one scheduler tick later.
    Delayed(bool),
}

/// Device-specific side of the update objects.
pub trait UpdateHandler: std::fmt::Debug + Send {
    /// Starts upgrading the firmware in the partition at `target`.
    /// `deferrable` is false once the server-set deferral period is over.
    fn perform_upgrade(
        &mut self,
        target: &Lwm2mPath,
        package: &PackageHeader,
        deferrable: bool,
    ) -> UpgradeOutcome;

    /// Installs a software package.
    fn install(&mut self, package: &PackageHeader) -> InstallOutcome;

    /// Removes an installed or delivered software package.
    fn uninstall(&mut self, package: &PackageHeader) -> bool;

    /// Activates installed software.
    fn activate(&mut self, package: &PackageHeader) -> bool;

    /// Deactivates installed software.
    fn deactivate(&mut self, package: &PackageHeader) -> bool;
}

/// The handler used by the client binary. Upgrades and installs succeed,
/// except as directed by the forced-error field of the package.
#[derive(Debug, Default, Clone)]
pub struct PackageInstaller {
    upgrades: usize,
}

impl PackageInstaller {
    /// Creates an installer.
    pub fn new() -> PackageInstaller {
        Default::default()
    }

    /// Number of upgrades started.
    pub fn upgrades(&self) -> usize {
        self.upgrades
    }
}

impl UpdateHandler for PackageInstaller {
    fn perform_upgrade(
        &mut self,
        target: &Lwm2mPath,
        package: &PackageHeader,
        deferrable: bool,
    ) -> UpgradeOutcome {
        self.upgrades += 1;
        let outcome = match package.forced_error {
            ForcedError::FailedUpdate => UpgradeOutcome::Failed,
            ForcedError::DelayedSuccess => UpgradeOutcome::Delayed(true),
            ForcedError::DelayedFailedUpdate => UpgradeOutcome::Delayed(false),
            ForcedError::SetSuccessInPerformUpgrade => UpgradeOutcome::Finished(true),
            ForcedError::SetFailureInPerformUpgrade => UpgradeOutcome::Finished(false),
            ForcedError::DoNothing => UpgradeOutcome::Pending,
            ForcedError::Defer if deferrable => UpgradeOutcome::Deferred,
            _ => UpgradeOutcome::Restart,
        };
        info!("{}: upgrade started: {:?}", target, outcome);
        outcome
    }

    fn install(&mut self, package: &PackageHeader) -> InstallOutcome {
        match package.forced_error {
            ForcedError::FailureInPerformInstall => InstallOutcome::Done(false),
            ForcedError::DelayedSuccess => InstallOutcome::Delayed(true),
            ForcedError::DelayedFailedUpdate => InstallOutcome::Delayed(false),
            _ => InstallOutcome::Done(true),
        }
    }

    fn uninstall(&mut self, package: &PackageHeader) -> bool {
        package.forced_error != ForcedError::FailureInPerformUninstall
    }

    fn activate(&mut self, package: &PackageHeader) -> bool {
        package.forced_error != ForcedError::FailureInPerformActivate
    }

    fn deactivate(&mut self, package: &PackageHeader) -> bool {
        package.forced_error != ForcedError::FailureInPerformDeactivate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(forced_error: ForcedError) -> PackageHeader {
        PackageHeader {
            forced_error,
            ..Default::default()
        }
    }

    #[test]
    fn forced_upgrade_outcomes() {
        let target = Lwm2mPath::instance(5, 0);
        let mut installer = PackageInstaller::new();
        let cases = [
            (ForcedError::None, UpgradeOutcome::Restart),
            (ForcedError::FailedUpdate, UpgradeOutcome::Failed),
            (ForcedError::DelayedSuccess, UpgradeOutcome::Delayed(true)),
            (ForcedError::SetFailureInPerformUpgrade, UpgradeOutcome::Finished(false)),
            (ForcedError::DoNothing, UpgradeOutcome::Pending),
            (ForcedError::Defer, UpgradeOutcome::Deferred),
        ];
        for (forced, expected) in cases.iter() {
            assert_eq!(
                *expected,
                installer.perform_upgrade(&target, &header(*forced), true),
                "{:?}",
                forced
            );
        }
        assert_eq!(
            UpgradeOutcome::Restart,
            installer.perform_upgrade(&target, &header(ForcedError::Defer), false)
        );
        assert_eq!(7, installer.upgrades());
    }

    #[test]
    fn forced_software_outcomes() {
        let mut installer = PackageInstaller::new();
        assert_eq!(
            InstallOutcome::Done(false),
            installer.install(&header(ForcedError::FailureInPerformInstall))
        );
        assert_eq!(InstallOutcome::Done(true), installer.install(&header(ForcedError::None)));
        assert!(!installer.activate(&header(ForcedError::FailureInPerformActivate)));
        assert!(installer.deactivate(&header(ForcedError::FailureInPerformActivate)));
        assert!(!installer.uninstall(&header(ForcedError::FailureInPerformUninstall)));
    }
}
