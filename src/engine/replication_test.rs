use pretty_assertions::assert_eq;

use crate::engine::replication::calculate_new_commit_index;
use crate::engine::testing::*;
use crate::engine::Command;
use crate::engine::Event;
use crate::engine::State;
use crate::error::NetworkError;
use crate::messages::AppendEntriesRequest;
use crate::messages::AppendEntriesResponse;
use crate::messages::ConflictOpt;
use crate::messages::Entry;
use crate::messages::Message;

fn client_write(eng: &mut UTEngine, cmd: &str) -> Vec<Command> {
    eng.step(Event::ClientWrite {
        command: cmd.as_bytes().to_vec(),
    })
    .expect("client write")
}

fn append_to(cmds: &[Command], target: &str) -> AppendEntriesRequest {
    appends(cmds).into_iter().find(|(t, _)| t == target).map(|(_, req)| req).expect("append request")
}

#[test]
fn test_leader_replicates_and_commits_with_majority() -> anyhow::Result<()> {
    let mut eng = leader();

    // The blank entry at index 1 is committed.
    assert_eq!(1, eng.commit_index());
    assert_eq!(log_id(1, 1), eng.last_applied());

    let cmds = client_write(&mut eng, "x");
    assert!(matches!(cmds.first(), Some(Command::ClientResponse(Ok(l))) if *l == log_id(1, 2)));
    assert_eq!(1, eng.commit_index(), "only the leader has it");

    let req = append_to(&cmds, "2");
    assert_eq!(1, req.prev_log_index);
    assert_eq!(1, req.prev_log_term);
    assert_eq!(1, req.entries.len());
    assert_eq!(log_id(1, 2), req.entries[0].log_id);

    ack(&mut eng, "2", req);
    assert_eq!(2, eng.commit_index());
    assert_eq!(log_id(1, 2), eng.last_applied());
    assert_eq!(vec![b"x".to_vec()], eng.state_machine().commands());
    assert_eq!((3, 2), progress_of(&mut eng, "2"));
    assert_eq!((2, 1), progress_of(&mut eng, "3"));

    // The next heartbeat tells the followers about the commit.
    let cmds = eng.step(Event::HeartbeatTimeout)?;
    for (_, req) in appends(&cmds) {
        assert_eq!(2, req.leader_commit);
    }
    Ok(())
}

#[test]
fn test_former_term_entries_commit_with_the_blank_entry() -> anyhow::Result<()> {
    let mut eng = eng_with(config(), store_with(2, &[ent(1, 1), ent(2, 2)]));
    let cmds = make_leader(&mut eng);
    assert_eq!(3, eng.current_term());

    let req = append_to(&cmds, "2");
    assert_eq!((2, 2), (req.prev_log_index, req.prev_log_term));
    assert_eq!(vec![Entry::new_blank(3, 3)], req.entries);

    // A majority holding index 2 does not commit it: it is of a former term.
    let mut up_to_2 = req.clone();
    up_to_2.entries.clear();
    ack(&mut eng, "2", up_to_2);
    assert_eq!((3, 2), progress_of(&mut eng, "2"));
    assert_eq!(0, eng.commit_index());

    ack(&mut eng, "2", req);
    assert_eq!(3, eng.commit_index());
    assert_eq!(log_id(3, 3), eng.last_applied());
    assert_eq!(
        vec![b"cmd-1-1".to_vec(), b"cmd-2-2".to_vec()],
        eng.state_machine().commands(),
        "the blank entry is not applied"
    );
    Ok(())
}

#[test]
fn test_learner_is_not_counted_in_commit_quorum() -> anyhow::Result<()> {
    let mut eng = leader();
    eng.membership.insert("4", "n4:1", false);
    eng.on_membership_changed();

    let cmds = client_write(&mut eng, "x");
    ack(&mut eng, "4", append_to(&cmds, "4"));
    assert_eq!(1, eng.commit_index(), "a learner does not count");

    ack(&mut eng, "3", append_to(&cmds, "3"));
    assert_eq!(2, eng.commit_index());
    Ok(())
}

#[test]
fn test_failure_backs_off_and_waits_for_heartbeat() -> anyhow::Result<()> {
    let store = store_with(3, &[ent(1, 1), ent(1, 2), ent(1, 3), ent(2, 4), ent(2, 5)]);
    let mut eng = eng_with(config(), store);
    let cmds = make_leader(&mut eng);
    let req = append_to(&cmds, "2");
    assert_eq!((5, 2), (req.prev_log_index, req.prev_log_term));

    // The follower holds term 1 at index 2..=5: resume after the leader's last entry of term 1.
    let cmds = reject(&mut eng, "2", req, Some(ConflictOpt { term: 1, index: 2 }));
    assert!(cmds.is_empty(), "no retry before the next heartbeat");
    assert_eq!((4, 0), progress_of(&mut eng, "2"));

    let cmds = eng.step(Event::HeartbeatTimeout)?;
    let retry = append_to(&cmds, "2");
    assert_eq!((3, 1), (retry.prev_log_index, retry.prev_log_term));
    assert_eq!(
        vec![log_id(2, 4), log_id(2, 5), log_id(4, 6)],
        retry.entries.iter().map(|e| e.log_id).collect::<Vec<_>>()
    );

    ack(&mut eng, "2", retry);
    assert_eq!((7, 6), progress_of(&mut eng, "2"));
    Ok(())
}

#[test]
fn test_conflict_hint_variants() -> anyhow::Result<()> {
    let store = || store_with(3, &[ent(1, 1), ent(1, 2), ent(1, 3), ent(2, 4), ent(2, 5)]);

    // The leader has no entry of the conflicting term: jump to the follower's first one.
    let mut eng = eng_with(config(), store());
    let req = append_to(&make_leader(&mut eng), "2");
    reject(&mut eng, "2", req, Some(ConflictOpt { term: 3, index: 4 }));
    assert_eq!(4, progress_of(&mut eng, "2").0);

    // The follower's log is short.
    let mut eng = eng_with(config(), store());
    let req = append_to(&make_leader(&mut eng), "2");
    reject(&mut eng, "2", req, Some(ConflictOpt { term: 0, index: 3 }));
    assert_eq!(3, progress_of(&mut eng, "2").0);

    // No hint: step back by one.
    let mut eng = eng_with(config(), store());
    let req = append_to(&make_leader(&mut eng), "2");
    reject(&mut eng, "2", req.clone(), None);
    assert_eq!(5, progress_of(&mut eng, "2").0);

    // A duplicate failure of the same request does not step back again.
    reject(&mut eng, "2", req, None);
    assert_eq!(5, progress_of(&mut eng, "2").0);

    // A hint never moves next_index forward.
    let mut eng = eng_with(config(), store());
    let req = append_to(&make_leader(&mut eng), "2");
    reject(&mut eng, "2", req, Some(ConflictOpt { term: 0, index: 100 }));
    assert_eq!(5, progress_of(&mut eng, "2").0);
    Ok(())
}

#[test]
fn test_replication_is_capped_by_max_payload_entries() -> anyhow::Result<()> {
    let config = crate::config::Config::build("ut".to_string()).max_payload_entries(2).validate()?;
    let store = store_with(1, &[ent(1, 1), ent(1, 2), ent(1, 3), ent(1, 4), ent(1, 5)]);
    let mut eng = eng_with(config, store);
    let req = append_to(&make_leader(&mut eng), "2");
    reject(&mut eng, "2", req, Some(ConflictOpt { term: 0, index: 1 }));

    let cmds = eng.step(Event::HeartbeatTimeout)?;
    let req = append_to(&cmds, "2");
    assert_eq!(0, req.prev_log_index);
    assert_eq!(vec![log_id(1, 1), log_id(1, 2)], req.entries.iter().map(|e| e.log_id).collect::<Vec<_>>());

    // A follower that is still behind gets the next batch right away.
    let cmds = ack(&mut eng, "2", req);
    let req = append_to(&cmds, "2");
    assert_eq!(2, req.prev_log_index);
    assert_eq!(vec![log_id(1, 3), log_id(1, 4)], req.entries.iter().map(|e| e.log_id).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_rpc_error_releases_follower() -> anyhow::Result<()> {
    let mut eng = leader();

    let cmds = client_write(&mut eng, "a");
    assert_eq!(2, appends(&cmds).len());

    let req = append_to(&cmds, "2");
    let cmds = eng.step(Event::RpcResult {
        target: "2".to_string(),
        request: Message::AppendEntriesRequest(req),
        result: Err(NetworkError::Timeout("2".to_string())),
    })?;
    assert!(cmds.is_empty());

    // "3" still has a request in flight.
    let cmds = client_write(&mut eng, "b");
    let targets = appends(&cmds).into_iter().map(|(t, _)| t).collect::<Vec<_>>();
    assert_eq!(vec!["2".to_string()], targets);
    assert_eq!(2, append_to(&cmds, "2").entries.len());
    Ok(())
}

#[test]
fn test_stale_and_higher_term_responses() -> anyhow::Result<()> {
    let mut eng = leader();
    let cmds = client_write(&mut eng, "a");
    let mut req = append_to(&cmds, "2");

    // A response to a request of a former term is ignored.
    req.term = 0;
    ack(&mut eng, "2", req.clone());
    assert_eq!((2, 1), progress_of(&mut eng, "2"));
    assert_eq!(1, eng.commit_index());

    // A higher term in a response dethrones the leader.
    req.term = 1;
    let cmds = eng.step(Event::RpcResult {
        target: "2".to_string(),
        request: Message::AppendEntriesRequest(req),
        result: Ok(Message::AppendEntriesResponse(AppendEntriesResponse {
            term: 4,
            success: false,
            match_index: 0,
            conflict: None,
        })),
    })?;
    assert_eq!(State::Follower, eng.state());
    assert_eq!(4, eng.current_term());
    assert_eq!(None, eng.current_leader());
    assert!(has_election_timer(&cmds));
    Ok(())
}

#[test]
fn test_heartbeat_timeout_is_ignored_by_non_leader() -> anyhow::Result<()> {
    let mut eng = eng();
    let cmds = eng.step(Event::HeartbeatTimeout)?;
    assert!(cmds.is_empty());
    Ok(())
}

mod calculate_new_commit_index {
    use pretty_assertions::assert_eq;

    use super::*;

    macro_rules! test_calculate_new_commit_index {
        ($name:ident, $expected:literal, $current:literal, $entries:expr) => {
            #[test]
            fn $name() {
                let mut entries = $entries;
                let output = calculate_new_commit_index(entries.clone(), $current);
                entries.sort_unstable();
                assert_eq!(output, $expected, "Sorted values: {:?}", entries);
            }
        };
    }

    test_calculate_new_commit_index!(basic_values, 10, 5, vec![20, 5, 0, 15, 10]);

    test_calculate_new_commit_index!(len_zero_should_return_current_commit, 20, 20, vec![]);

    test_calculate_new_commit_index!(len_one_where_greater_than_current, 100, 0, vec![100]);

    test_calculate_new_commit_index!(len_one_where_less_than_current, 100, 100, vec![50]);

    test_calculate_new_commit_index!(even_number_of_nodes, 0, 0, vec![0, 100, 0, 100, 0, 100]);

    test_calculate_new_commit_index!(majority_wins, 100, 0, vec![0, 100, 0, 100, 0, 100, 100]);

    test_calculate_new_commit_index!(never_goes_backwards, 50, 50, vec![0, 10, 20]);
}
