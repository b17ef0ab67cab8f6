use causalbus::builtin::{Gain, Mix, Sine};
use causalbus::engine::new;
use causalbus::{
    from_fn, BusId, BusLayout, Engine, EngineConfig, EngineError, Placement, Process, Sample,
    Status, TickContext, Token,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

const FRAMES: usize = 8;

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_block_size(FRAMES)
        .with_channels(1, 1)
        .with_limits(8, 8)
}

fn block(engine: &mut Engine) -> Vec<Sample> {
    let input = vec![0.0; FRAMES];
    let mut out = vec![0.0; FRAMES];
    engine.process_block(&[input.as_slice()], &mut [out.as_mut_slice()]).unwrap();
    out
}

struct Constant {
    bus: BusId,
    value: Sample,
    teardowns: Arc<AtomicUsize>,
}

impl Process for Constant {
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status {
        if let Some(bus) = ctx.bus_mut(self.bus) {
            bus.advance();
            bus.front_mut().fill(self.value);
        }
        Status::Continue
    }

    fn teardown(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }

    fn output_bus(&self) -> Option<BusId> {
        Some(self.bus)
    }
}

#[test]
fn spawn_route_detach_collect() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let (mut ctl, mut engine) = new(config()).unwrap();
    let count = Arc::clone(&teardowns);
    let (id, bus) = ctl
        .spawn_writer(BusLayout::mono(FRAMES), Placement::Back, move |bus| Constant {
            bus,
            value: 0.75,
            teardowns: count,
        })
        .unwrap();
    ctl.route_output(0, bus, 0).unwrap();
    assert_eq!(ctl.bus_of(id), Some(bus));

    assert_eq!(block(&mut engine), vec![0.75; FRAMES]);
    assert_eq!(engine.registry().token(id), Token::FIRST);
    assert_eq!(engine.buses().get(bus).unwrap().writer(), Token::FIRST);

    ctl.detach(id).unwrap();
    assert!(matches!(ctl.detach(id), Err(EngineError::UnknownProcess(_))));
    assert_eq!(teardowns.load(Ordering::SeqCst), 0);

    // The detach lands at the next block; the route now points at nothing.
    assert_eq!(block(&mut engine), vec![0.0; FRAMES]);
    assert!(!engine.registry().contains(id));
    assert!(engine.buses().get(bus).is_none());

    assert_eq!(ctl.collect_garbage(), 2);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(!ctl.is_live(id));
    assert_eq!(ctl.process_count(), 0);
    assert!(matches!(ctl.route_output(0, bus, 0), Err(EngineError::UnknownBus(_))));
}

#[test]
fn finished_process_is_detached_by_the_engine() {
    let (mut ctl, mut engine) = new(config()).unwrap();
    let mut remaining = 3;
    let id = ctl
        .spawn(from_fn(move |_| {
            remaining -= 1;
            if remaining == 0 {
                Status::Done
            } else {
                Status::Continue
            }
        }))
        .unwrap();

    for _ in 0..2 {
        block(&mut engine);
        assert!(engine.registry().is_linked(id));
    }
    block(&mut engine);
    assert!(!engine.registry().contains(id));
    assert_eq!(ctl.collect_garbage(), 1);
    assert!(!ctl.is_live(id));
}

#[test]
fn spawn_front_runs_first_with_latest_token() {
    let (mut ctl, mut engine) = new(config()).unwrap();
    let a = ctl.spawn(from_fn(|_| Status::Continue)).unwrap();
    let b = ctl.spawn(from_fn(|_| Status::Continue)).unwrap();
    let c = ctl.spawn_front(from_fn(|_| Status::Continue)).unwrap();
    block(&mut engine);
    let order: Vec<_> = engine.registry().iter().collect();
    assert_eq!(order, vec![(c, Token(3)), (a, Token(1)), (b, Token(2))]);
}

#[test]
fn sine_through_gain_and_mix() {
    let (mut ctl, mut engine) = new(config()).unwrap();
    let layout = BusLayout::mono(FRAMES);
    let (_, osc) = ctl
        .spawn_writer(layout, Placement::Back, |bus| Sine::new(bus, 1000.0, 44100.0))
        .unwrap();
    let (_, half) = ctl
        .spawn_writer(layout, Placement::Back, |bus| Gain::new(osc, bus, 0.5))
        .unwrap();
    let (_, sum) = ctl
        .spawn_writer(layout, Placement::Back, |bus| Mix::new(vec![osc, half], bus))
        .unwrap();
    ctl.route_output(0, sum, 0).unwrap();

    let out = block(&mut engine);
    let source = engine.buses().get(osc).unwrap().latest().to_vec();
    for (o, s) in out.iter().zip(&source) {
        assert!((o - s * 1.5).abs() < 1e-6);
    }
}

struct Feedback {
    own: BusId,
    peer: Arc<OnceLock<BusId>>,
    bias: Sample,
    scale: Sample,
}

impl Process for Feedback {
    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Status {
        let Some((out, view)) = ctx.split(self.own) else {
            return Status::Continue;
        };
        let heard = self
            .peer
            .get()
            .and_then(|peer| view.read(*peer))
            .map(|b| b[0])
            .unwrap_or(0.0);
        out.advance();
        out.front_mut().fill(self.bias + self.scale * heard);
        Status::Continue
    }
}

#[test]
fn feedback_loop_settles_with_one_block_delay() {
    let (mut ctl, mut engine) = new(config()).unwrap();
    let layout = BusLayout::mono(FRAMES);
    let a_peer = Arc::new(OnceLock::new());
    let peer = Arc::clone(&a_peer);
    let (_, a_bus) = ctl
        .spawn_writer(layout, Placement::Back, move |own| Feedback {
            own,
            peer,
            bias: 1.0,
            scale: 0.5,
        })
        .unwrap();
    let b_peer = Arc::new(OnceLock::new());
    b_peer.set(a_bus).unwrap();
    let (_, b_bus) = ctl
        .spawn_writer(layout, Placement::Back, move |own| Feedback {
            own,
            peer: b_peer,
            bias: 0.0,
            scale: 1.0,
        })
        .unwrap();
    a_peer.set(b_bus).unwrap();
    ctl.route_output(0, a_bus, 0).unwrap();

    let firsts: Vec<Sample> = (0..3).map(|_| block(&mut engine)[0]).collect();
    assert_eq!(firsts, vec![1.0, 1.5, 1.75]);

    let mut last = 0.0;
    for _ in 0..200 {
        last = block(&mut engine)[0];
        assert!(last.is_finite() && last <= 2.0);
    }
    assert!((last - 2.0).abs() < 1e-4);
}

#[test]
fn boundary_errors_leave_time_untouched() {
    let (_ctl, mut engine) = new(config()).unwrap();
    let input = vec![0.0; FRAMES];
    let mut short = vec![0.0; FRAMES - 1];
    assert_eq!(
        engine.process_block(&[input.as_slice()], &mut [short.as_mut_slice()]),
        Err(EngineError::BlockSizeMismatch {
            expected: FRAMES,
            got: FRAMES - 1
        })
    );
    let mut out = vec![0.0; FRAMES];
    let mut extra = vec![0.0; FRAMES];
    assert_eq!(
        engine.process_block(&[input.as_slice()], &mut [out.as_mut_slice(), extra.as_mut_slice()]),
        Err(EngineError::ChannelCountMismatch {
            expected: 1,
            got: 2
        })
    );
    assert_eq!(engine.elapsed(), 0);
}

#[test]
fn handles_are_reused_with_new_generation() {
    let (mut ctl, mut engine) = new(config().with_limits(1, 4)).unwrap();
    let first = ctl.spawn(from_fn(|_| Status::Continue)).unwrap();
    assert!(matches!(
        ctl.spawn(from_fn(|_| Status::Continue)),
        Err(EngineError::ProcessLimit { max: 1 })
    ));
    block(&mut engine);
    ctl.detach(first).unwrap();
    block(&mut engine);
    ctl.collect_garbage();

    let second = ctl.spawn(from_fn(|_| Status::Continue)).unwrap();
    assert_eq!(first.index(), second.index());
    assert_ne!(first, second);
    assert!(matches!(ctl.detach(first), Err(EngineError::UnknownProcess(_))));
    block(&mut engine);
    assert!(engine.registry().is_linked(second));
    assert!(!engine.registry().contains(first));
}

#[test]
fn invalid_config_is_rejected() {
    let err = new(EngineConfig::default().with_block_size(0)).unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}

#[test]
fn garbage_waits_for_room_in_order() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let (mut ctl, mut engine) = new(config().with_garbage_capacity(1)).unwrap();
    let mut ids = Vec::new();
    for value in [0.25, 0.5] {
        let count = Arc::clone(&teardowns);
        let (id, _) = ctl
            .spawn_writer(BusLayout::mono(FRAMES), Placement::Back, move |bus| Constant {
                bus,
                value,
                teardowns: count,
            })
            .unwrap();
        ids.push(id);
    }
    block(&mut engine);
    for &id in &ids {
        ctl.detach(id).unwrap();
    }
    block(&mut engine);
    // Two processes and two buses against a single queue slot.
    assert_eq!(engine.stalled_garbage(), 3);

    let mut collected = Vec::new();
    for _ in 0..4 {
        collected.push(ctl.collect_garbage());
        block(&mut engine);
    }
    assert_eq!(collected, vec![1, 1, 1, 1]);
    assert_eq!(engine.stalled_garbage(), 0);
    assert_eq!(ctl.collect_garbage(), 0);
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);
    assert_eq!(ctl.process_count(), 0);
    assert!(ids.iter().all(|&id| !ctl.is_live(id)));
}

#[test]
fn writer_declaring_foreign_bus_is_rejected() {
    // Room for the input bus and one more.
    let (mut ctl, mut engine) = new(config().with_limits(4, 2)).unwrap();
    let input = ctl.input_bus();
    let err = ctl
        .spawn_writer(BusLayout::mono(FRAMES), Placement::Back, |_bus| {
            Gain::new(input, input, 1.0)
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::ForeignOutputBus { declared, .. } if declared == input));
    assert_eq!(ctl.process_count(), 0);

    // The bus slot was handed back, so a well-formed writer still fits.
    let (id, bus) = ctl
        .spawn_writer(BusLayout::mono(FRAMES), Placement::Back, |bus| {
            Gain::new(input, bus, 1.0)
        })
        .unwrap();
    block(&mut engine);
    assert!(engine.registry().is_linked(id));
    assert!(engine.buses().get(bus).is_some());
}
