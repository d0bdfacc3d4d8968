// Copyright 2020 Replset Developers

mod common;

use std::collections::HashSet;

use serde_json::json;

use replset::error::Error;
use replset::node::Tags;
use replset::protocol::QueryOptions;
use replset::read_preference::ReadPreference;

use common::{cluster, options, replica_set, FakeNetwork, FakeServer, A, B, C};

fn served_by<T: replset::connection::Transport>(
    cluster: &replset::cluster::Cluster<T>,
    pref: ReadPreference,
    tags: &[Tags],
) -> Result<String, Error> {
    cluster.with_read_preference(pref, tags, |node| Ok(node.address().to_string()))
}

fn tags(key: &str, value: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(key.to_string(), value.to_string());
    tags
}

fn tagged_set() -> FakeNetwork {
    let network = FakeNetwork::new();
    network.add(A, FakeServer::primary(&[A, B, C]).with_tag("dc", "east"));
    network.add(B, FakeServer::secondary(&[A, B, C]).with_tag("dc", "east"));
    network.add(C, FakeServer::secondary(&[A, B, C]).with_tag("dc", "west"));
    network
}

#[test]
fn read_preference_primary_and_secondary() {
    let network = replica_set();
    let cluster = cluster(&network, &[A], options());

    // The first selection bootstraps the ring.
    for _ in 0..4 {
        assert_eq!(served_by(&cluster, ReadPreference::Primary, &[]).unwrap(), A);
    }

    let secondaries: HashSet<String> = (0..4)
        .map(|_| served_by(&cluster, ReadPreference::Secondary, &[]).unwrap())
        .collect();
    assert_eq!(secondaries.len(), 2);
    assert!(secondaries.contains(B) && secondaries.contains(C));

    let preferred =
        served_by(&cluster, ReadPreference::SecondaryPreferred, &[]).unwrap();
    assert_ne!(preferred, A);
}

#[test]
fn read_preference_primary_preferred_falls_back() {
    let network = replica_set();
    let cluster = cluster(&network, &[A], options());
    cluster.refresh();

    assert_eq!(
        served_by(&cluster, ReadPreference::PrimaryPreferred, &[]).unwrap(),
        A
    );

    network.set_reachable(A, false);
    cluster.refresh();

    let fallback =
        served_by(&cluster, ReadPreference::PrimaryPreferred, &[]).unwrap();
    assert!(fallback == B || fallback == C);

    match served_by(&cluster, ReadPreference::Primary, &[]) {
        Err(Error::ConnectionFailure(msg)) => {
            assert!(msg.contains("no primary available"));
            assert!(msg.contains(A));
        }
        other => panic!("expected ConnectionFailure, got {:?}", other),
    }
}

#[test]
fn read_preference_secondary_preferred_falls_back() {
    let network = replica_set();
    let cluster = cluster(&network, &[A], options());
    cluster.refresh();

    network.set_reachable(B, false);
    network.set_reachable(C, false);
    cluster.refresh();

    assert_eq!(
        served_by(&cluster, ReadPreference::SecondaryPreferred, &[]).unwrap(),
        A
    );
    assert!(served_by(&cluster, ReadPreference::Secondary, &[]).is_err());
}

#[test]
fn read_preference_tags_filter_secondaries() {
    let network = tagged_set();
    let cluster = cluster(&network, &[A], options());
    cluster.refresh();

    let west = [tags("dc", "west")];
    for _ in 0..4 {
        assert_eq!(
            served_by(&cluster, ReadPreference::Secondary, &west).unwrap(),
            C
        );
    }

    // Any of several tag sets may match.
    let either = [tags("dc", "north"), tags("dc", "east")];
    assert_eq!(
        served_by(&cluster, ReadPreference::Secondary, &either).unwrap(),
        B
    );

    // The primary is never filtered by tags.
    let nowhere = [tags("dc", "south")];
    assert!(served_by(&cluster, ReadPreference::Secondary, &nowhere).is_err());
    assert_eq!(
        served_by(&cluster, ReadPreference::SecondaryPreferred, &nowhere)
            .unwrap(),
        A
    );
}

#[test]
fn read_preference_nearest() {
    let network = tagged_set();
    let cluster = cluster(&network, &[A], options());
    cluster.refresh();

    for _ in 0..10 {
        let nearest =
            served_by(&cluster, ReadPreference::Nearest, &[]).unwrap();
        assert!(nearest == A || nearest == B || nearest == C);
    }

    let west = [tags("dc", "west")];
    assert_eq!(
        served_by(&cluster, ReadPreference::Nearest, &west).unwrap(),
        C
    );

    let nowhere = [tags("dc", "south")];
    assert!(served_by(&cluster, ReadPreference::Nearest, &nowhere).is_err());
}

#[test]
fn read_preference_sets_secondary_ok() {
    let network = replica_set();
    let cluster = cluster(&network, &[A], options());

    let pref = ReadPreference::Secondary;
    let reply = cluster
        .with_read_preference(pref, &[], |node| {
            node.query(
                "test",
                "widgets",
                common::doc(json!({})),
                pref.query_options(QueryOptions::default()),
            )
        })
        .unwrap();
    assert_eq!(reply.documents[0]["secondary_ok"], true);
    assert_ne!(reply.documents[0]["served_by"], A);

    // Without the flag a secondary refuses the read.
    let result = cluster.with_read_preference(pref, &[], |node| {
        node.query(
            "test",
            "widgets",
            common::doc(json!({})),
            QueryOptions::default(),
        )
    });
    match result {
        Err(Error::ReplicaSetReconfigured { .. }) => (),
        other => panic!("expected ReplicaSetReconfigured, got {:?}", other),
    }
}

#[test]
fn read_preference_unavailable_without_candidates() {
    let network = replica_set();
    let cluster = cluster(&network, &[A], options());
    cluster.refresh();

    for addr in &[A, B, C] {
        network.set_reachable(addr, false);
    }
    cluster.refresh();

    match ReadPreference::PrimaryPreferred.select(&cluster.ring(), &[]) {
        Err(Error::Unavailable(_)) => (),
        Err(other) => panic!("expected Unavailable, got {:?}", other),
        Ok(node) => panic!("expected Unavailable, got {}", node.address()),
    }
}
