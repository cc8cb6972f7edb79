//! Turn state machine property tests
//!
//! Random request sequences checked against the turn graph

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use ava_voice::{IdleGuard, TurnState, TurnStateMachine};

#[derive(Debug, Clone, Copy)]
enum Request {
    Transition(TurnState),
    Decide,
    BeginSpeaking,
    ForceIdle,
}

fn random_request(rng: &mut StdRng) -> Request {
    match rng.gen_range(0..10) {
        0 => Request::ForceIdle,
        1 => Request::Decide,
        2 => Request::BeginSpeaking,
        _ => Request::Transition(*TurnState::ALL.choose(rng).unwrap()),
    }
}

#[test]
fn test_random_sequences_follow_graph() {
    for seed in 0..64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let machine = TurnStateMachine::new();

        for step in 0..500 {
            let before = machine.state();
            let request = random_request(&mut rng);

            match request {
                Request::Transition(to) => {
                    machine.transition(to, "prop");
                }
                Request::Decide => {
                    machine.decide("prop");
                }
                Request::BeginSpeaking => {
                    if let Some(token) = machine.current_token() {
                        machine.begin_speaking(&token, "prop");
                    }
                }
                Request::ForceIdle => machine.force_idle("prop"),
            }

            let after = machine.state();
            let context = format!("seed {seed} step {step}: {before} --{request:?}--> {after}");

            if matches!(request, Request::ForceIdle) {
                assert_eq!(after, TurnState::Idle, "{context}");
                assert!(machine.current_token().is_none(), "{context}");
                continue;
            }
            if before == TurnState::Speak {
                assert_eq!(after, TurnState::Speak, "{context}");
                continue;
            }
            assert!(
                after == before || before.can_transition_to(after),
                "{context}"
            );
            if after == TurnState::Decide || after == TurnState::Speak {
                assert!(machine.current_token().is_some(), "{context}");
            }
            if after == TurnState::Idle && before != TurnState::Idle {
                assert!(machine.current_token().is_none(), "{context}");
            }
        }
    }
}

#[test]
fn test_force_idle_from_every_state() {
    for target in TurnState::ALL {
        let machine = TurnStateMachine::new();
        machine.transition(TurnState::Listen, "walk");
        machine.transition(TurnState::Final, "walk");
        let token = machine.decide("walk").unwrap();
        machine.begin_speaking(&token, "walk");
        machine.force_idle("reset");

        match target {
            TurnState::Idle => {}
            TurnState::Listen => {
                machine.transition(TurnState::Listen, "walk");
            }
            TurnState::Final => {
                machine.transition(TurnState::Listen, "walk");
                machine.transition(TurnState::Final, "walk");
            }
            TurnState::Decide | TurnState::Speak => {
                machine.transition(TurnState::Listen, "walk");
                machine.transition(TurnState::Final, "walk");
                let token = machine.decide("walk").unwrap();
                if target == TurnState::Speak {
                    assert!(machine.begin_speaking(&token, "walk"));
                }
            }
        }
        assert_eq!(machine.state(), target);

        machine.force_idle("test");
        assert_eq!(machine.state(), TurnState::Idle);
        assert!(machine.current_token().is_none());
    }
}

#[test]
fn test_decide_tokens_are_fresh() {
    let machine = TurnStateMachine::new();
    let mut seen = HashSet::new();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..200 {
        machine.transition(TurnState::Listen, "turn");
        machine.transition(TurnState::Final, "turn");
        let token = machine.decide("turn").unwrap();
        assert!(seen.insert(token.clone()), "token {token} reused");

        let guard = IdleGuard::for_token(&machine, token.clone(), "done");
        if rng.gen_bool(0.5) {
            assert!(machine.begin_speaking(&token, "turn"));
        }
        drop(guard);
        assert_eq!(machine.state(), TurnState::Idle);
    }
}

#[test]
fn test_speak_ignores_everything_but_idle() {
    let machine = TurnStateMachine::new();
    machine.transition(TurnState::Listen, "turn");
    machine.transition(TurnState::Final, "turn");
    let token = machine.decide("turn").unwrap();
    assert!(machine.begin_speaking(&token, "turn"));
    assert!(machine.is_speaking());

    for to in TurnState::ALL {
        assert!(!machine.transition(to, "ignored"));
        assert_eq!(machine.state(), TurnState::Speak);
    }
    assert!(machine.decide("ignored").is_none());
    assert!(machine.authorize(Some(&token)));

    assert!(machine.release(&token, "done"));
    assert_eq!(machine.state(), TurnState::Idle);
    assert!(!machine.release(&token, "again"));
}
