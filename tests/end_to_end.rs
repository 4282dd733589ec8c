//! End-to-end bus scenarios on a scripted mock transport.

mod helpers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::timeout;

use canlink::{
    BusOptions, CanBus, CanError, CanErrorInfo, CanReceiveData, FilterRule, FrameErrorType, IdType,
};
use helpers::{frame, MockTransport};

fn open_bus(transport: &Arc<MockTransport>, options: BusOptions) -> CanBus {
    CanBus::open(Arc::clone(transport) as Arc<dyn canlink::CanTransport>, options).unwrap()
}

fn fast_poll() -> BusOptions {
    BusOptions {
        poll_timeout: Duration::from_millis(10),
        ..BusOptions::default()
    }
}

#[tokio::test]
async fn mask_filter_end_to_end() {
    let transport = MockTransport::new();
    let options = BusOptions {
        software_filters: vec![FilterRule::Mask {
            code: 0x100,
            mask: 0x700,
            id_type: IdType::Standard,
        }],
        ..fast_poll()
    };
    let bus = open_bus(&transport, options);

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        bus.subscribe(move |data: &CanReceiveData| {
            seen.lock().unwrap().push(data.frame.id());
        });
    }
    let mut stream = Box::pin(bus.frames());

    for id in [0x100, 0x200, 0x300] {
        transport.inject(frame(id));
    }

    let first = timeout(Duration::from_millis(200), stream.next())
        .await
        .expect("filtered frame should arrive within 200ms")
        .unwrap()
        .unwrap();
    assert_eq!(first.frame.id(), 0x100);
    // Nothing else may leak through the filter.
    assert!(timeout(Duration::from_millis(100), stream.next()).await.is_err());
    assert_eq!(*seen.lock().unwrap(), vec![0x100]);

    bus.close();
}

#[tokio::test]
async fn fan_out_reaches_callback_and_pipe_exactly_once() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());

    let callback_hits: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let hits = Arc::clone(&callback_hits);
        bus.subscribe(move |data: &CanReceiveData| {
            hits.lock().unwrap().push(data.frame.id());
        });
    }

    transport.inject(frame(0x42));
    let got = bus.receive_async(1, Duration::from_millis(500)).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].frame.id(), 0x42);
    assert_eq!(*callback_hits.lock().unwrap(), vec![0x42]);

    // Exactly once: no duplicate sits in the pipe.
    assert!(bus.receive(1, Duration::from_millis(50)).unwrap().is_empty());
    bus.close();
}

#[tokio::test]
async fn stream_preserves_publish_order() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());
    let mut stream = Box::pin(bus.frames());

    let ids: Vec<u32> = (1..=20).collect();
    for id in &ids {
        transport.inject(frame(*id));
    }
    let mut observed = Vec::new();
    for _ in 0..ids.len() {
        let item = timeout(Duration::from_millis(500), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        observed.push(item.frame.id());
    }
    assert_eq!(observed, ids);
    bus.close();
}

#[test]
fn backlog_larger_than_one_drain_batch_arrives_complete_and_ordered() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());

    // Well past two full drain batches, so one wake-up chains several.
    let ids: Vec<u32> = (1..=150).collect();
    for id in &ids {
        transport.inject(frame(*id));
    }
    let got = bus.receive(ids.len(), Duration::from_secs(2)).unwrap();
    let observed: Vec<u32> = got.iter().map(|d| d.frame.id()).collect();
    assert_eq!(observed, ids);
    bus.close();
}

#[test]
fn partial_batch_receive_returns_what_arrived() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());

    for id in [1, 2, 3] {
        transport.inject(frame(id));
    }
    let got = bus.receive(10, Duration::from_millis(150)).unwrap();
    assert_eq!(got.len(), 3);
    bus.close();
}

#[test]
fn error_frames_reach_only_error_subscribers() {
    let transport = MockTransport::new();
    let options = BusOptions {
        receive_error_frames: true,
        ..fast_poll()
    };
    let bus = open_bus(&transport, options);

    let errors: Arc<Mutex<Vec<CanErrorInfo>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = Arc::clone(&errors);
        bus.subscribe_errors(move |info: &CanErrorInfo| {
            errors.lock().unwrap().push(info.clone());
        })
        .unwrap();
    }

    // Bus-off error frame.
    transport.inject_error_frame(0x0000_0040, &[0, 0, 0, 0, 0, 0, 0, 0]);
    std::thread::sleep(Duration::from_millis(100));

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error_type.contains(FrameErrorType::BUS_OFF));
    // The data pipe never carries error frames.
    assert!(bus.receive(1, Duration::from_millis(20)).unwrap().is_empty());
    bus.close();
}

#[test]
fn error_subscription_requires_opt_in() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());
    let err = bus.subscribe_errors(|_| {}).unwrap_err();
    assert!(matches!(err, CanError::NotSupported(_)));
    bus.close();
}

#[tokio::test]
async fn fatal_transport_error_faults_everything() {
    let transport = MockTransport::new();
    let bus = Arc::new(open_bus(&transport, fast_poll()));
    let faults = bus.faults();

    let pending = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { bus.receive_async(1, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    transport.fail_wait_with(CanError::Transport("device unplugged".into()));

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CanError::BackgroundFault(_)));
    // The background-fault channel carries the same failure.
    let fault = faults.recv_timeout(Duration::from_millis(500)).unwrap();
    assert!(matches!(fault, CanError::BackgroundFault(_)));
    // Later calls observe the fault too, never a stale success.
    assert!(bus.receive(1, Duration::ZERO).is_err());
}

#[test]
fn close_unblocks_pending_receivers() {
    let transport = MockTransport::new();
    let bus = Arc::new(open_bus(&transport, fast_poll()));

    let waiter = {
        let bus = Arc::clone(&bus);
        std::thread::spawn(move || bus.receive(1, Duration::from_secs(10)))
    };
    std::thread::sleep(Duration::from_millis(50));
    bus.close();

    let result = waiter.join().unwrap();
    assert_eq!(result.unwrap_err(), CanError::BusClosed);
    assert!(bus.is_closed());
    assert_eq!(bus.receive(1, Duration::ZERO).unwrap_err(), CanError::BusClosed);
    // Idempotent.
    bus.close();
}

#[test]
fn transmit_writes_through_the_transport() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());

    let frames = vec![frame(0x10), frame(0x11), frame(0x12)];
    let sent = bus.transmit(&frames, Duration::from_millis(100)).unwrap();
    assert_eq!(sent, 3);
    assert_eq!(transport.written_count(), 3);
    bus.close();
}

#[tokio::test]
async fn transmit_async_writes_through_the_transport() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());

    let sent = bus
        .transmit_async(vec![frame(0x20), frame(0x21)], Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(sent, 2);
    assert_eq!(transport.written_count(), 2);
    bus.close();
}

#[test]
fn software_filters_can_be_replaced_at_runtime() {
    let transport = MockTransport::new();
    let bus = open_bus(&transport, fast_poll());

    bus.set_software_filters(vec![FilterRule::Range {
        from: 0x500,
        to: 0x50F,
        id_type: IdType::Standard,
    }])
    .unwrap();

    transport.inject(frame(0x400));
    transport.inject(frame(0x505));
    let got = bus.receive(2, Duration::from_millis(200)).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].frame.id(), 0x505);

    // Bad rules are rejected synchronously and leave the old set in place.
    let err = bus
        .set_software_filters(vec![FilterRule::Range {
            from: 0x50F,
            to: 0x500,
            id_type: IdType::Standard,
        }])
        .unwrap_err();
    assert!(matches!(err, CanError::Config(_)));
    bus.close();
}

#[test]
fn bounded_pipe_drops_oldest_frames() {
    let transport = MockTransport::new();
    let options = BusOptions {
        pipe_capacity: Some(4),
        ..fast_poll()
    };
    let bus = open_bus(&transport, options);

    for id in 1..=10u32 {
        transport.inject(frame(id));
    }
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(bus.dropped_frames(), 6);
    let got = bus.receive(4, Duration::from_millis(100)).unwrap();
    let ids: Vec<u32> = got.iter().map(|d| d.frame.id()).collect();
    assert_eq!(ids, vec![7, 8, 9, 10]);
    bus.close();
}
