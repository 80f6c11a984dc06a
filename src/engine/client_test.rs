use pretty_assertions::assert_eq;

use crate::engine::testing::*;
use crate::engine::Command;
use crate::engine::Event;
use crate::engine::State;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::NotLeaderError;
use crate::membership::Membership;
use crate::messages::AppendEntriesRequest;
use crate::messages::EntryPayload;
use crate::messages::Message;
use crate::storage::LogStore;
use crate::LogId;

fn change(eng: &mut UTEngine, membership: Membership) -> Result<LogId, ChangeMembershipError> {
    let cmds = eng.step(Event::ChangeMembership { membership }).expect("change membership");
    let mut res = None;
    for c in cmds {
        if let Command::MembershipResponse(r) = c {
            res = Some(r);
        }
    }
    res.expect("membership response")
}

fn write(eng: &mut UTEngine, cmd: &str) -> (Result<LogId, ClientWriteError>, Vec<Command>) {
    let mut cmds = eng
        .step(Event::ClientWrite {
            command: cmd.as_bytes().to_vec(),
        })
        .expect("client write");
    let pos = cmds.iter().position(|c| matches!(c, Command::ClientResponse(_))).expect("client response");
    match cmds.remove(pos) {
        Command::ClientResponse(res) => (res, cmds),
        _ => unreachable!(),
    }
}

#[test]
fn test_client_write_to_follower_is_forwarded() -> anyhow::Result<()> {
    let mut eng = eng();

    let (res, cmds) = write(&mut eng, "x");
    match res {
        Err(ClientWriteError::ForwardToLeader(e)) => assert_eq!(NotLeaderError { leader_id: None }, e),
        other => panic!("unexpected {:?}", other),
    }
    assert!(cmds.is_empty());

    // Once a leader is known it is reported.
    eng.step(Event::RpcReceived {
        from: "3".to_string(),
        message: Message::AppendEntriesRequest(AppendEntriesRequest {
            term: 1,
            leader_id: "3".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        }),
    })?;
    let (res, _) = write(&mut eng, "x");
    match res {
        Err(ClientWriteError::ForwardToLeader(e)) => assert_eq!(Some("3".to_string()), e.leader_id),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(0, eng.store().last_log_id().index);
    Ok(())
}

#[test]
fn test_client_write_to_leader_is_durable_before_response() -> anyhow::Result<()> {
    let mut eng = leader();

    let (res, _) = write(&mut eng, "x");
    assert_eq!(log_id(1, 2), res?);
    let (res, _) = write(&mut eng, "y");
    assert_eq!(log_id(1, 3), res?);

    let entry = eng.store().get_entry(3).expect("entry 3");
    assert_eq!(EntryPayload::Normal(b"y".to_vec()), entry.payload);
    Ok(())
}

#[test]
fn test_change_membership_rejections() -> anyhow::Result<()> {
    let mut follower = eng();
    assert!(matches!(
        change(&mut follower, m123().with_voter("4", "n4:1")),
        Err(ChangeMembershipError::NotLeader(_))
    ));

    let mut eng = leader();
    assert!(matches!(
        change(&mut eng, Membership::new().with_learner("1", "n1:1")),
        Err(ChangeMembershipError::EmptyVoters)
    ));
    assert!(matches!(change(&mut eng, m123()), Err(ChangeMembershipError::Noop)));
    assert!(matches!(
        change(&mut eng, m123().with_voter("4", "n4:1").with_voter("5", "n5:1")),
        Err(ChangeMembershipError::TooManyVoterChanges { changes: 2 })
    ));
    assert_eq!(log_id(1, 1), eng.store().last_log_id(), "nothing appended after the blank entry");
    Ok(())
}

#[test]
fn test_add_voter() -> anyhow::Result<()> {
    let mut eng = leader();
    let m1234 = m123().with_voter("4", "n4:1");

    let log_id_2 = change(&mut eng, m1234.clone())?;
    assert_eq!(log_id(1, 2), log_id_2);
    assert_eq!(&m1234, eng.membership(), "in effect once appended");
    assert_eq!((3, 0), progress_of(&mut eng, "4"));

    // One change at a time.
    assert!(matches!(
        change(&mut eng, m1234.clone().with_learner("5", "n5:1")),
        Err(ChangeMembershipError::ChangeInProgress { .. })
    ));

    // The new config needs 3 of 4 voters.
    let cmds = eng.step(Event::HeartbeatTimeout)?;
    for (target, req) in appends(&cmds) {
        if target == "2" || target == "4" {
            ack(&mut eng, &target, req);
        }
    }
    assert_eq!(2, eng.commit_index());

    let log_id_3 = change(&mut eng, m1234.with_learner("5", "n5:1"))?;
    assert_eq!(log_id(1, 3), log_id_3);
    Ok(())
}

#[test]
fn test_removed_leader_steps_down_after_commit() -> anyhow::Result<()> {
    let mut eng = leader();
    let m23 = Membership::new().with_voter("2", "n2:1").with_voter("3", "n3:1");

    change(&mut eng, m23)?;
    assert_eq!(State::Leader, eng.state(), "leads until the change commits");

    let cmds = eng.step(Event::HeartbeatTimeout)?;
    let reqs = appends(&cmds);
    assert_eq!(vec!["2".to_string(), "3".to_string()], reqs.iter().map(|(t, _)| t.clone()).collect::<Vec<_>>());

    let mut reqs = reqs.into_iter();
    let (t, req) = reqs.next().expect("request to 2");
    ack(&mut eng, &t, req);
    assert_eq!(State::Leader, eng.state(), "its own log does not count any more");

    let (t, req) = reqs.next().expect("request to 3");
    ack(&mut eng, &t, req);
    assert_eq!(2, eng.commit_index());
    assert_eq!(State::Learner, eng.state());
    assert_eq!(None, eng.current_leader());
    Ok(())
}
