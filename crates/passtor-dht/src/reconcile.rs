//! Reconciliation of replica answers

use passtor_core::Account;

/// Pick the most represented verified record.
///
/// Records failing signature verification are dropped, the rest are grouped
/// by signature. Returns the record of the largest group (the earliest seen
/// group on ties) and whether that group has at least `min` members.
pub fn most_represented(accounts: &[Account], min: usize) -> (Option<Account>, bool) {
    let mut groups: Vec<(&Account, usize)> = Vec::new();

    for account in accounts.iter().filter(|a| a.verify()) {
        match groups.iter_mut().find(|(a, _)| a.signature == account.signature) {
            Some((_, count)) => *count += 1,
            None => groups.push((account, 1)),
        }
    }

    let mut best: Option<(&Account, usize)> = None;
    for (account, count) in groups {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((account, count));
        }
    }

    match best {
        Some((account, count)) => (Some(account.clone()), count >= min),
        None => (None, false),
    }
}
