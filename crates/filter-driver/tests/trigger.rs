// SPDX-License-Identifier: AGPL-3.0-only

//! Trigger protocol, colored frames and pointer relay against the simulated card

mod common;

use common::{count, is_read, is_write, last_position, open, pattern, position};
use filter_driver::backends::Access;
use filter_driver::chip::dma::Direction;
use filter_driver::chip::regs;
use filter_driver::{
    run_colored, run_trigger_protocol, FilterError, Frame, PointerRelay, ProtocolState, ProtocolTiming,
    SimConfig, TriggerProtocol,
};
use std::sync::Arc;

fn protocol(poll_limit: u32) -> TriggerProtocol {
    TriggerProtocol::new(ProtocolTiming::immediate().with_poll_limit(poll_limit))
}

fn is_dma(direction: Direction, bank: usize) -> impl Fn(&Access) -> bool {
    move |a| matches!(a, Access::Dma { direction: d, bank: b, .. } if *d == direction && *b == bank)
}

fn inverted(data: &[u8]) -> Vec<u8> {
    data.iter().map(|v| !v).collect()
}

#[test]
fn handshake_runs_in_order() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let input = pattern(32);
    let mut output = vec![0; 32];

    let mut runner = protocol(100);
    runner.set_image_size(&com, 32).unwrap();
    probe.clear_trace();
    let polls = runner.run(&mut com, &input, &mut output).unwrap();
    let trace = probe.trace();

    assert_eq!(polls, 2);
    assert_eq!(runner.state(), ProtocolState::Idle);
    assert_eq!(output, inverted(&input));

    let to_card = position(&trace, is_dma(Direction::ToCard, 0));
    let refresh_high = position(&trace, is_write(regs::REFRESH, 1));
    let refresh_low = position(&trace, is_write(regs::REFRESH, 0));
    let enable = position(&trace, is_write(regs::ENABLE, 1));
    let first_poll = position(&trace, is_read(regs::FINISH));
    let last_poll = last_position(&trace, is_read(regs::FINISH));
    let disable = position(&trace, is_write(regs::ENABLE, 0));
    let to_host = position(&trace, is_dma(Direction::ToHost, 1));

    assert!(to_card < refresh_high);
    assert!(refresh_high < refresh_low);
    assert!(refresh_low < enable);
    assert!(enable < first_poll);
    assert!(last_poll < disable);
    assert!(disable < to_host);
    assert_eq!(count(&trace, is_read(regs::FINISH)), 2);
}

#[test]
fn timeout_disables_and_leaves_output_alone() {
    let (mut com, probe, _file) = open(
        SimConfig {
            finish_after_polls: None,
            ..SimConfig::default()
        },
        64,
    );
    let input = pattern(32);
    let mut output = vec![0x5a; 32];

    let mut runner = protocol(7);
    runner.set_image_size(&com, 32).unwrap();
    probe.clear_trace();
    let err = runner.run(&mut com, &input, &mut output).unwrap_err();
    let trace = probe.trace();

    let FilterError::ProtocolTimeout { polls, snapshot } = err else {
        panic!("expected a protocol timeout");
    };
    assert_eq!(polls, 7);
    assert_eq!(snapshot.enable, 1);
    assert_eq!(snapshot.refresh, 0);
    assert_eq!(snapshot.image_size, 32);

    assert_eq!(count(&trace, is_read(regs::FINISH)), 7);
    assert!(last_position(&trace, is_read(regs::FINISH)) < position(&trace, is_write(regs::ENABLE, 0)));
    assert_eq!(count(&trace, is_dma(Direction::ToHost, 1)), 0);
    assert_eq!(probe.register(regs::ENABLE), 0);
    assert_eq!(runner.state(), ProtocolState::Disabled);
    assert!(output.iter().all(|&v| v == 0x5a));
}

#[test]
fn finish_on_last_allowed_poll_succeeds() {
    let (mut com, _probe, _file) = open(
        SimConfig {
            finish_after_polls: Some(5),
            ..SimConfig::default()
        },
        64,
    );
    let input = pattern(16);
    let mut output = vec![0; 16];

    let mut runner = protocol(5);
    runner.set_image_size(&com, 16).unwrap();
    assert_eq!(runner.run(&mut com, &input, &mut output).unwrap(), 5);
}

#[cfg(target_pointer_width = "64")]
#[test]
fn geometry_wider_than_register_is_rejected_unwritten() {
    let (com, probe, _file) = open(SimConfig::default(), 64);
    let runner = protocol(5);
    let too_big = u32::MAX as usize + 1;
    probe.clear_trace();

    let err = runner.set_image_size(&com, too_big).unwrap_err();
    assert!(matches!(err, FilterError::FrameMismatch { .. }), "{err}");
    let err = runner.configure(&com, 32, too_big).unwrap_err();
    assert!(matches!(err, FilterError::FrameMismatch { .. }), "{err}");
    assert!(probe.trace().is_empty());

    runner.configure(&com, 32, 8).unwrap();
    assert_eq!(probe.register(regs::IMAGE_SIZE), 32);
    assert_eq!(probe.register(regs::IMAGE_WIDTH), 8);
}

#[test]
fn timed_out_card_recovers_on_next_frame() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let input = pattern(32);
    let mut output = vec![0; 32];
    let mut runner = protocol(3);
    runner.set_image_size(&com, 32).unwrap();

    probe.set_finish_after_polls(None);
    assert!(runner.run(&mut com, &input, &mut output).unwrap_err().is_per_frame());

    probe.set_finish_after_polls(Some(1));
    assert_eq!(runner.run(&mut com, &input, &mut output).unwrap(), 1);
    assert_eq!(output, inverted(&input));
}

#[test]
fn convenience_runner_writes_image_size_only() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let input = pattern(32);
    let mut output = vec![0; 32];

    probe.clear_trace();
    run_trigger_protocol(&mut com, &input, &mut output, 32, 1000).unwrap();
    let trace = probe.trace();

    assert_eq!(probe.register(regs::IMAGE_SIZE), 32);
    assert_eq!(count(&trace, |a| matches!(a, Access::Write { index, .. } if *index == regs::IMAGE_WIDTH)), 0);
    assert_eq!(output, inverted(&input));
}

#[test]
fn three_test_runs_back_to_back() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let input = pattern(32);

    for _ in 0..3 {
        let mut output = vec![0; 32];
        run_trigger_protocol(&mut com, &input, &mut output, 32, 1000).unwrap();
        assert_eq!(output, inverted(&input));
    }
    assert_eq!(probe.filter_runs(), 3);
}

#[test]
fn short_buffer_is_frame_mismatch() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let input = pattern(16);
    let mut output = vec![0; 32];

    probe.clear_trace();
    let err = run_trigger_protocol(&mut com, &input, &mut output, 32, 1000).unwrap_err();
    assert!(matches!(err, FilterError::FrameMismatch { .. }));
    assert!(probe.trace().is_empty());
}

#[test]
fn colored_frame_runs_once_per_plane() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let frame = Frame::new(4, 2, 3, pattern(24)).unwrap();

    let mut runner = protocol(100);
    runner.set_image_size(&com, frame.plane_size()).unwrap();
    probe.clear_trace();
    let result = run_colored(&mut runner, &mut com, &frame).unwrap();
    let trace = probe.trace();

    assert_eq!(probe.filter_runs(), 3);
    assert_eq!(count(&trace, is_write(regs::ENABLE, 1)), 3);
    assert_eq!(result.channels(), 3);
    assert_eq!(result.data(), inverted(frame.data()).as_slice());
}

#[test]
fn colored_frame_rejects_mismatched_image_size() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let frame = Frame::new(4, 2, 3, pattern(24)).unwrap();

    let mut runner = protocol(100);
    runner.set_image_size(&com, 16).unwrap();
    let err = run_colored(&mut runner, &mut com, &frame).unwrap_err();

    assert!(matches!(err, FilterError::FrameMismatch { .. }));
    assert_eq!(probe.filter_runs(), 0);
}

#[test]
fn colored_stops_at_first_failed_plane() {
    let (mut com, probe, _file) = open(
        SimConfig {
            finish_after_polls: None,
            ..SimConfig::default()
        },
        64,
    );
    let frame = Frame::new(4, 2, 3, pattern(24)).unwrap();

    let mut runner = protocol(2);
    runner.set_image_size(&com, frame.plane_size()).unwrap();
    let err = run_colored(&mut runner, &mut com, &frame).unwrap_err();

    assert!(matches!(err, FilterError::ProtocolTimeout { polls: 2, .. }));
    assert_eq!(probe.filter_runs(), 1);
}

#[test]
fn grayscale_frame_is_a_single_pass() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let frame = Frame::new(4, 4, 1, pattern(16)).unwrap();

    let mut runner = protocol(100);
    runner.set_image_size(&com, frame.plane_size()).unwrap();
    let result = run_colored(&mut runner, &mut com, &frame).unwrap();

    assert_eq!(probe.filter_runs(), 1);
    assert_eq!(result.data(), inverted(frame.data()).as_slice());
}

#[test]
fn pointer_flushed_once_per_scope() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let relay = PointerRelay::new();
    relay.record_click(120, 45);

    let input = pattern(32);
    let mut output = vec![0; 32];
    let mut runner = protocol(100);
    runner.set_image_size(&com, 32).unwrap();
    probe.clear_trace();
    {
        let mut scope = relay.scope(&mut com);
        runner.run(&mut *scope, &input, &mut output).unwrap();
    }
    let trace = probe.trace();

    assert_eq!(count(&trace, is_write(regs::CLICK, 1)), 1);
    assert_eq!(count(&trace, is_write(regs::CLICK_X, 120)), 1);
    assert_eq!(count(&trace, is_write(regs::CLICK_Y, 45)), 1);
    assert!(position(&trace, is_dma(Direction::ToHost, 1)) < position(&trace, is_write(regs::CLICK, 1)));
    assert!(!relay.is_pending());

    probe.clear_trace();
    drop(relay.scope(&mut com));
    let trace = probe.trace();
    assert_eq!(count(&trace, is_write(regs::CLICK, 0)), 1);
    assert_eq!(count(&trace, is_write(regs::CLICK, 1)), 0);
}

#[test]
fn pointer_flushed_when_pass_fails() {
    let (mut com, probe, _file) = open(
        SimConfig {
            finish_after_polls: None,
            ..SimConfig::default()
        },
        64,
    );
    let relay = PointerRelay::new();
    relay.record_click(7, 9);

    let input = pattern(32);
    let mut output = vec![0; 32];
    let mut runner = protocol(2);
    runner.set_image_size(&com, 32).unwrap();

    let result = {
        let mut scope = relay.scope(&mut com);
        runner.run(&mut *scope, &input, &mut output)
    };

    assert!(result.is_err());
    assert_eq!(probe.register(regs::CLICK), 1);
    assert_eq!(probe.register(regs::CLICK_X), 7);
    assert_eq!(probe.register(regs::CLICK_Y), 9);
    assert!(!relay.is_pending());
}

#[test]
fn click_from_input_thread_reaches_card() {
    let (mut com, probe, _file) = open(SimConfig::default(), 64);
    let relay = Arc::new(PointerRelay::new());

    let input_side = Arc::clone(&relay);
    std::thread::spawn(move || input_side.record_click(300, 200))
        .join()
        .unwrap();

    assert!(relay.is_pending());
    drop(relay.scope(&mut com));

    assert_eq!(probe.register(regs::CLICK), 1);
    assert_eq!(probe.register(regs::CLICK_X), 300);
    assert_eq!(probe.register(regs::CLICK_Y), 200);
}
