//! Partition pending work by shared identity credential.
//!
//! One credential group = one browser profile = one interactive login,
//! however many sites the credential services. This is the device that
//! keeps interactive logins at the identity provider to one per
//! credential per run.

use crate::provider::Credential;

/// One (site, account label) pair still needing the slow path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPair {
    pub site_key: String,
    pub label: String,
}

#[derive(Debug)]
pub struct CredentialGroup<'a> {
    pub credential: &'a Credential,
    pub site_keys: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Grouping<'a> {
    pub groups: Vec<CredentialGroup<'a>>,
    /// Pairs whose label matched no configured credential; surfaced so
    /// the caller records them instead of dropping them silently.
    pub unmatched: Vec<PendingPair>,
}

/// Pure partition of pairs by credential label, preserving the pair
/// order within each group and the credential order across groups.
pub fn group_by_credential<'a>(
    pairs: Vec<PendingPair>,
    credentials: &'a [Credential],
) -> Grouping<'a> {
    let mut grouping = Grouping::default();

    for pair in pairs {
        match credentials.iter().position(|c| c.label == pair.label) {
            Some(cred_index) => {
                let existing = grouping
                    .groups
                    .iter()
                    .position(|g| g.credential.label == pair.label);
                let group_index = match existing {
                    Some(index) => index,
                    None => {
                        grouping.groups.push(CredentialGroup {
                            credential: &credentials[cred_index],
                            site_keys: Vec::new(),
                        });
                        grouping.groups.len() - 1
                    }
                };
                grouping.groups[group_index].site_keys.push(pair.site_key);
            }
            None => {
                tracing::warn!(label = %pair.label, site = %pair.site_key,
                    "no credential configured for pending pair");
                grouping.unmatched.push(pair);
            }
        }
    }

    grouping
}
