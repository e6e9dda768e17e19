//! Matching tunnels across reconnects
//!
//! A reconnecting agent may omit tunnels it expects the server to keep. Given
//! the tunnels of the previous connection (`old`) and the freshly requested
//! ones (`new`), [`tunnels_to_reestablish`] returns the old tunnels that must
//! be recreated next to the new ones.
//!
//! Old tunnels with a server-assigned local port carry that port, so a new
//! request for exactly that port is matched first; requests without a local
//! side are matched against the remaining random-port tunnels afterwards.
//! Matching is first found in iteration order.

use revtun_proto::ForwardingSpec;

/// Old tunnels not covered by `new`; random local sides are cleared so a
/// fresh port gets picked. Empty when `new` is not a subset of `old`.
pub fn tunnels_to_reestablish(old: &[ForwardingSpec], new: &[ForwardingSpec]) -> Vec<ForwardingSpec> {
    if new.len() > old.len() {
        return Vec::new();
    }

    let mut matched = vec![false; old.len()];

    // explicit locals first, they may claim a port that was random before
    for requested in new.iter().filter(|spec| spec.is_local_specified()) {
        let wanted = requested.to_string();
        let found = old
            .iter()
            .enumerate()
            .find(|(i, previous)| !matched[*i] && previous.to_string() == wanted);
        match found {
            Some((i, _)) => matched[i] = true,
            None => return Vec::new(),
        }
    }

    for requested in new.iter().filter(|spec| !spec.is_local_specified()) {
        let found = old.iter().enumerate().find(|(i, previous)| {
            !matched[*i] && previous.local_port_random && previous.remote_equal(requested)
        });
        match found {
            Some((i, _)) => matched[i] = true,
            None => return Vec::new(),
        }
    }

    old.iter()
        .zip(matched)
        .filter(|(_, matched)| !matched)
        .map(|(previous, _)| {
            let mut spec = previous.clone();
            if spec.local_port_random {
                spec.clear_local();
            }
            spec
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RANDOM_PORTS: [u16; 5] = [5001, 5002, 5003, 5004, 5005];

    fn parse(input: &str) -> ForwardingSpec {
        input.parse().unwrap()
    }

    /// Parse old tunnels, handing out random ports to those without a local side
    fn old(inputs: &[&str]) -> Vec<ForwardingSpec> {
        inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let mut spec = parse(input);
                if !spec.is_local_specified() {
                    spec.assign_random_local(RANDOM_PORTS[i]);
                }
                spec
            })
            .collect()
    }

    fn new(inputs: &[&str]) -> Vec<ForwardingSpec> {
        inputs.iter().map(|input| parse(input)).collect()
    }

    fn strings(specs: Vec<ForwardingSpec>) -> Vec<String> {
        specs.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_both_empty() {
        assert!(tunnels_to_reestablish(&[], &[]).is_empty());
    }

    #[test]
    fn test_no_new_tunnels_recreates_all() {
        let old = old(&[
            "192.168.0.1:3000:google.com:80",
            "3000:site.com:80",
            "foobar.com:3000",
            "3000",
        ]);
        assert_eq!(
            strings(tunnels_to_reestablish(&old, &[])),
            vec![
                "192.168.0.1:3000:google.com:80",
                "0.0.0.0:3000:site.com:80",
                "::foobar.com:3000",
                "::127.0.0.1:3000",
            ]
        );
    }

    #[test]
    fn test_more_new_than_old() {
        let new = new(&["3000:site.com:80", "3000"]);
        assert!(tunnels_to_reestablish(&[], &new).is_empty());
    }

    #[test]
    fn test_same_tunnels_in_every_form() {
        let forms = [
            "192.168.0.1:3000:google.com:80",
            "3000:site.com:80",
            "foobar.com:3000",
            "3000",
        ];
        assert!(tunnels_to_reestablish(&old(&forms), &new(&forms)).is_empty());
    }

    #[test]
    fn test_old_superset_returns_the_rest() {
        let old = old(&[
            "192.168.0.1:3000:google.com:80",
            "3000:site.com:80",
            "192.168.0.1:3001:google.com:80",
            "foobar.com:3001",
        ]);
        let new = new(&["192.168.0.1:3000:google.com:80", "3000:site.com:80"]);
        assert_eq!(
            strings(tunnels_to_reestablish(&old, &new)),
            vec!["192.168.0.1:3001:google.com:80", "::foobar.com:3001"]
        );
    }

    #[test]
    fn test_request_for_previously_random_port_matches() {
        let old = old(&["127.0.0.1:3000"]);
        let port = old[0].local_port.unwrap();
        let new = vec![ForwardingSpec::new("127.0.0.1", 3000).with_local("0.0.0.0", port)];
        assert!(tunnels_to_reestablish(&old, &new).is_empty());
    }

    #[test]
    fn test_explicit_and_random_requests_mixed() {
        let old = old(&[
            "192.168.0.1:3000:google.com:80",
            "foobar.com:22",
            "3000",
            "foobar.com:22",
            "3000",
        ]);
        let new = new(&[
            "0.0.0.0:5002:foobar.com:22",
            "0.0.0.0:5003:127.0.0.1:3000",
            "foobar.com:22",
            "3000",
        ]);
        assert_eq!(
            strings(tunnels_to_reestablish(&old, &new)),
            vec!["192.168.0.1:3000:google.com:80"]
        );
    }

    #[test]
    fn test_unknown_explicit_request_aborts() {
        let old = old(&["192.168.0.1:3000:google.com:80", "foobar.com:22", "foobar.com:22"]);
        let new = new(&["0.0.0.0:5003:foobar.com:22", "0.0.0.0:5004:foobar.com:22"]);
        assert!(tunnels_to_reestablish(&old, &new).is_empty());
    }

    #[test]
    fn test_explicit_old_local_is_not_matched_by_random_request() {
        let old = old(&["0.0.0.0:3000:foobar.com:22"]);
        let new = new(&["foobar.com:22"]);
        assert!(tunnels_to_reestablish(&old, &new).is_empty());
    }

    #[test]
    fn test_acl_must_match_for_random_requests() {
        let old = vec![
            {
                let mut spec = parse("foobar.com:22").with_acl("10.0.0.1");
                spec.assign_random_local(5001);
                spec
            },
            {
                let mut spec = parse("foobar.com:22").with_acl("10.0.0.2");
                spec.assign_random_local(5002);
                spec
            },
        ];
        let new = vec![parse("foobar.com:22").with_acl("10.0.0.2")];
        let result = tunnels_to_reestablish(&old, &new);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].acl.as_deref(), Some("10.0.0.1"));
        assert_eq!(result[0].local_port, None);
    }

    #[test]
    fn test_equivalent_acl_spellings_match() {
        let old = vec![
            {
                let mut spec = parse("foobar.com:22").with_acl("10.0.0.1");
                spec.assign_random_local(5001);
                spec
            },
            {
                let mut spec = parse("10.0.0.6:80");
                spec.assign_random_local(5002);
                spec
            },
        ];
        let new = vec![parse("foobar.com:22").with_acl("10.0.0.1/32")];
        let result = tunnels_to_reestablish(&old, &new);
        assert_eq!(strings(result), vec!["::10.0.0.6:80"]);
    }

    #[test]
    fn test_first_match_wins_between_identical_candidates() {
        let old = old(&["foobar.com:22", "foobar.com:22"]);
        let new = new(&["foobar.com:22"]);
        let result = tunnels_to_reestablish(&old, &new);
        assert_eq!(strings(result), vec!["::foobar.com:22"]);
    }

    #[test]
    fn test_idempotent_and_bounded() {
        let old = old(&[
            "192.168.0.1:3000:google.com:80",
            "3000:site.com:80",
            "foobar.com:3000",
        ]);
        assert!(tunnels_to_reestablish(&old, &old).is_empty());

        for n in 0..=old.len() {
            let result = tunnels_to_reestablish(&old, &old[..n]);
            assert!(result.len() <= old.len());
        }
    }
}
