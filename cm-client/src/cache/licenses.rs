//! License to package to app reconciliation.

use cm_proto::{AppInfo, PackageInfo, PackageRequest};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A license as the cache sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    pub package_id: u32,
    /// Granted through another account (family sharing).
    pub shared: bool,
    pub access_token: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageEntry {
    pub shared: bool,
    pub access_token: u64,
    pub app_ids: BTreeSet<u32>,
    pub importing: bool,
}

impl PackageEntry {
    pub fn is_resolved(&self) -> bool {
        !self.app_ids.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppEntry {
    pub app_id: u32,
    pub name: Option<String>,
    pub app_type: Option<String>,
    pub parent: Option<u32>,
    pub packages: BTreeSet<u32>,
}

impl AppEntry {
    fn is_type(&self, wanted: &str) -> bool {
        self.app_type
            .as_deref()
            .map(|t| t.eq_ignore_ascii_case(wanted))
            .unwrap_or(false)
    }
}

/// What a license batch requires from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseImport {
    pub full_reset: bool,
    pub to_request: Vec<PackageRequest>,
}

pub struct LicenseCache {
    reset_threshold: usize,
    packages: BTreeMap<u32, PackageEntry>,
    apps: BTreeMap<u32, AppEntry>,
    last_package_set: BTreeSet<u32>,
    packages_to_parse: usize,
    apps_pending: HashSet<u32>,
    ready: watch::Sender<bool>,
}

impl LicenseCache {
    pub fn new(reset_threshold: usize) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            reset_threshold,
            packages: BTreeMap::new(),
            apps: BTreeMap::new(),
            last_package_set: BTreeSet::new(),
            packages_to_parse: 0,
            apps_pending: HashSet::new(),
            ready,
        }
    }

    /// Applies a license batch and returns the package info to request.
    ///
    /// A changed package set below the reset threshold clears every
    /// association and re-requests the whole batch. Otherwise only packages
    /// that have not resolved to an app yet are requested.
    pub fn reconcile(&mut self, licenses: &[License]) -> LicenseImport {
        let ids: BTreeSet<u32> = licenses.iter().map(|l| l.package_id).collect();
        let full_reset = ids != self.last_package_set && ids.len() < self.reset_threshold;

        if full_reset {
            info!(
                "License set changed ({} -> {} packages), re-importing everything",
                self.last_package_set.len(),
                ids.len()
            );
            self.packages.clear();
            self.apps.clear();
            self.apps_pending.clear();
        }

        let mut to_request = Vec::new();
        let mut queued = HashSet::new();
        for license in licenses {
            let entry = self.packages.entry(license.package_id).or_default();
            entry.shared = license.shared;
            entry.access_token = license.access_token;

            if entry.is_resolved() || !queued.insert(license.package_id) {
                continue;
            }
            entry.importing = true;
            to_request.push(PackageRequest {
                package_id: license.package_id,
                access_token: license.access_token,
            });
        }

        debug!(
            "License batch: {} packages, {} to request, full reset: {}",
            ids.len(),
            to_request.len(),
            full_reset
        );

        self.last_package_set = ids;
        self.packages_to_parse = to_request.len();
        self.update_ready();

        LicenseImport {
            full_reset,
            to_request,
        }
    }

    /// Records package contents. Returns apps whose metadata is still unknown.
    pub fn on_package_info(&mut self, packages: &[PackageInfo]) -> Vec<u32> {
        let mut new_apps = Vec::new();

        for info in packages {
            let Some(entry) = self.packages.get_mut(&info.package_id) else {
                warn!("Skipping info for unlicensed package {}", info.package_id);
                continue;
            };

            if entry.importing {
                entry.importing = false;
                self.packages_to_parse = self.packages_to_parse.saturating_sub(1);
            }

            for app_id in &info.app_ids {
                entry.app_ids.insert(*app_id);

                let app = self.apps.entry(*app_id).or_insert_with(|| AppEntry {
                    app_id: *app_id,
                    ..AppEntry::default()
                });
                app.packages.insert(info.package_id);

                if app.app_type.is_none() && self.apps_pending.insert(*app_id) {
                    new_apps.push(*app_id);
                }
            }
        }

        self.update_ready();
        new_apps
    }

    pub fn on_app_info(&mut self, apps: &[AppInfo]) {
        for info in apps {
            self.apps_pending.remove(&info.app_id);

            let app = self.apps.entry(info.app_id).or_insert_with(|| AppEntry {
                app_id: info.app_id,
                ..AppEntry::default()
            });
            if info.name.is_some() {
                app.name = info.name.clone();
            }
            if info.app_type.is_some() {
                app.app_type = info.app_type.clone();
            }
            if info.parent.is_some() {
                app.parent = info.parent;
            }
        }

        self.update_ready();
    }

    fn update_ready(&self) {
        let ready = self.packages_to_parse == 0 && self.apps_pending.is_empty();
        self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
    }

    /// Flips to `true` once every requested package and app has been parsed.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn package(&self, package_id: u32) -> Option<&PackageEntry> {
        self.packages.get(&package_id)
    }

    pub fn app(&self, app_id: u32) -> Option<&AppEntry> {
        self.apps.get(&app_id)
    }

    pub fn resolved_packages(&self) -> BTreeSet<u32> {
        self.packages
            .iter()
            .filter(|(_, entry)| entry.is_resolved())
            .map(|(id, _)| *id)
            .collect()
    }

    fn apps_of_type(&self, wanted: &str) -> impl Iterator<Item = &AppEntry> {
        let wanted = wanted.to_string();
        self.apps.values().filter(move |app| app.is_type(&wanted))
    }

    fn owned_directly(&self, app: &AppEntry) -> bool {
        app.packages
            .iter()
            .filter_map(|id| self.packages.get(id))
            .any(|package| !package.shared)
    }

    /// Games licensed to this account.
    pub fn owned_games(&self) -> Vec<AppEntry> {
        self.apps_of_type("game")
            .filter(|app| self.owned_directly(app))
            .cloned()
            .collect()
    }

    pub fn dlcs(&self) -> Vec<AppEntry> {
        self.apps_of_type("dlc")
            .filter(|app| self.owned_directly(app))
            .cloned()
            .collect()
    }

    /// Games only available through another account's licenses.
    pub fn shared_games(&self) -> Vec<AppEntry> {
        self.apps_of_type("game")
            .filter(|app| !self.owned_directly(app))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn licenses(ids: &[u32]) -> Vec<License> {
        ids.iter()
            .map(|id| License {
                package_id: *id,
                shared: false,
                access_token: 0,
            })
            .collect()
    }

    fn requested(import: &LicenseImport) -> Vec<u32> {
        import.to_request.iter().map(|p| p.package_id).collect()
    }

    fn package_info(package_id: u32, app_ids: &[u32]) -> PackageInfo {
        PackageInfo {
            package_id,
            app_ids: app_ids.to_vec(),
        }
    }

    fn game(app_id: u32) -> AppInfo {
        AppInfo {
            app_id,
            name: Some(format!("Game {}", app_id)),
            app_type: Some("Game".to_string()),
            parent: None,
        }
    }

    #[test]
    fn test_changed_set_triggers_full_reset() {
        let mut cache = LicenseCache::new(12_000);
        cache.reconcile(&licenses(&[1, 2, 3]));
        cache.on_package_info(&[
            package_info(1, &[10]),
            package_info(2, &[20]),
            package_info(3, &[30]),
        ]);
        assert_eq!(cache.resolved_packages().len(), 3);

        let import = cache.reconcile(&licenses(&[1, 2, 3, 4]));

        assert!(import.full_reset);
        assert_eq!(requested(&import), vec![1, 2, 3, 4]);
        assert!(cache.resolved_packages().is_empty());
        assert!(cache.app(10).is_none());
    }

    #[test]
    fn test_same_batch_is_idempotent() {
        let mut cache = LicenseCache::new(12_000);
        let batch = licenses(&[1, 2]);

        let first = cache.reconcile(&batch);
        cache.on_package_info(&[package_info(1, &[10])]);
        let resolved = cache.resolved_packages();

        let second = cache.reconcile(&batch);

        assert!(first.full_reset);
        assert!(!second.full_reset);
        assert_eq!(requested(&second), vec![2]);
        assert_eq!(cache.resolved_packages(), resolved);
    }

    #[test]
    fn test_large_set_skips_reset() {
        let mut cache = LicenseCache::new(3);
        cache.reconcile(&licenses(&[1]));
        cache.on_package_info(&[package_info(1, &[10])]);

        let import = cache.reconcile(&licenses(&[1, 2, 3]));

        assert!(!import.full_reset);
        assert_eq!(requested(&import), vec![2, 3]);
        assert!(cache.package(1).unwrap().is_resolved());
    }

    #[test]
    fn test_ready_after_packages_and_apps() {
        let mut cache = LicenseCache::new(12_000);
        let ready = cache.subscribe_ready();

        cache.reconcile(&licenses(&[1]));
        assert!(!*ready.borrow());

        let new_apps = cache.on_package_info(&[package_info(1, &[10, 11])]);
        assert_eq!(new_apps, vec![10, 11]);
        assert!(!cache.is_ready());

        cache.on_app_info(&[game(10), game(11)]);
        assert!(*ready.borrow());
    }

    #[test]
    fn test_owned_and_shared_games() {
        let mut cache = LicenseCache::new(12_000);
        cache.reconcile(&[
            License {
                package_id: 1,
                shared: false,
                access_token: 0,
            },
            License {
                package_id: 2,
                shared: true,
                access_token: 5,
            },
        ]);
        cache.on_package_info(&[package_info(1, &[10, 12]), package_info(2, &[20])]);
        cache.on_app_info(&[
            game(10),
            game(20),
            AppInfo {
                app_id: 12,
                name: Some("Soundtrack".to_string()),
                app_type: Some("DLC".to_string()),
                parent: Some(10),
            },
        ]);

        let owned: Vec<u32> = cache.owned_games().iter().map(|a| a.app_id).collect();
        let shared: Vec<u32> = cache.shared_games().iter().map(|a| a.app_id).collect();
        let dlcs: Vec<u32> = cache.dlcs().iter().map(|a| a.app_id).collect();

        assert_eq!(owned, vec![10]);
        assert_eq!(shared, vec![20]);
        assert_eq!(dlcs, vec![12]);
    }

    #[test]
    fn test_unknown_package_info_skipped() {
        let mut cache = LicenseCache::new(12_000);
        cache.reconcile(&licenses(&[1]));

        let new_apps = cache.on_package_info(&[package_info(99, &[990]), package_info(1, &[10])]);

        assert_eq!(new_apps, vec![10]);
        assert!(cache.app(990).is_none());
    }

    proptest! {
        #[test]
        fn repeated_batch_never_resets(ids in proptest::collection::btree_set(1u32..500, 1..40)) {
            let ids: Vec<u32> = ids.into_iter().collect();
            let mut cache = LicenseCache::new(12_000);

            cache.reconcile(&licenses(&ids));
            let before = cache.resolved_packages();
            let again = cache.reconcile(&licenses(&ids));

            prop_assert!(!again.full_reset);
            prop_assert_eq!(cache.resolved_packages(), before);
        }
    }
}
