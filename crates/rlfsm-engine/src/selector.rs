//! Source selection for transfer subscriptions.

use rand::{Rng, seq::SliceRandom};
use rlfsm_core::subscription::Subscription;

/// Pick the site a transfer should read from.
///
/// Disk beats tape. Among several disk sites, ones without a recorded failure
/// are preferred, picked at random; once every disk site has failed, the one
/// with the fewest failures wins, earliest in inventory order on a tie. A lone
/// disk site is used even if it failed before.
///
/// Tape takes over once every disk site last reported one of the `missing`
/// exit codes, choosing among tape sites the same way.
///
/// Returns `None` only when the subscription has no source at all.
pub fn select_source<R: Rng + ?Sized>(
  subscription: &Subscription,
  missing: &[i32],
  rng: &mut R,
) -> Option<String> {
  let disk = &subscription.disk_sources;
  let tape = &subscription.tape_sources;
  let failed = &subscription.failed_sources;

  if disk.is_empty() {
    return tape.choose(rng).cloned();
  }

  let disk_exhausted = disk.iter().all(|site| {
    failed
      .get(site)
      .and_then(|codes| codes.last())
      .is_some_and(|code| missing.contains(code))
  });
  if disk_exhausted && !tape.is_empty() {
    return least_failed(tape, subscription, rng);
  }

  match disk.as_slice() {
    [only] => Some(only.clone()),
    _ => least_failed(disk, subscription, rng),
  }
}

/// A random site without failures, else the one with the fewest.
fn least_failed<R: Rng + ?Sized>(
  sites: &[String],
  subscription: &Subscription,
  rng: &mut R,
) -> Option<String> {
  let failed = &subscription.failed_sources;
  let untried: Vec<&String> =
    sites.iter().filter(|site| !failed.contains_key(*site)).collect();
  if let Some(site) = untried.choose(rng) {
    return Some((*site).clone());
  }
  sites
    .iter()
    .min_by_key(|site| failed.get(*site).map_or(0, Vec::len))
    .cloned()
}
