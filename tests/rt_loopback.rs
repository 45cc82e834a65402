//! End-to-end realtime round trip over UDP loopback.
//!
//! A frozen publisher and a frozen subscriber run in the same process; one
//! publish tick must land in the subscriber's external memory after one
//! receive tick, through real sockets.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use uapub::{
    BuiltInType, ConnectionConfig, DataSetMetaData, DataSetReaderConfig, DataSetWriterConfig,
    DataValue, ExternalCell, ExternalValue, FieldConfig, FieldMetaData, NodeId, PubSub,
    PublishedDataSetConfig, PublisherId, ReaderGroupConfig, TargetVariable, ValueBackend, Variant,
    WriterGroupConfig,
};

const PUBLISHER: PublisherId = PublisherId::UInt16(2234);
const WRITER_GROUP: u16 = 100;
const DATA_SET_WRITER: u16 = 62541;

struct Loopback {
    pubsub: PubSub,
    writer_group: uapub::WriterGroupId,
    subscriber_conn: uapub::ConnectionId,
    reader: uapub::ReaderId,
    source_cell: ExternalCell,
    target_cell: ExternalCell,
    writes: Rc<Cell<u32>>,
}

/// Wire up a frozen publisher and a frozen subscriber on `address` with one
/// UInt32 field.
fn rt_loopback(address: &str) -> Loopback {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut pubsub = PubSub::new();

    let publisher_conn = pubsub
        .add_connection(ConnectionConfig::new("publisher", address, PUBLISHER))
        .unwrap();
    let ds = pubsub
        .add_published_data_set(PublishedDataSetConfig::new("demo"))
        .unwrap();
    let field = FieldConfig::new_static("speed", Variant::UInt32(0));
    let source_cell = field.static_cell().unwrap();
    pubsub.add_data_set_field(ds, field).unwrap();
    let writer_group = pubsub
        .add_writer_group(
            publisher_conn,
            WriterGroupConfig::new("wg", WRITER_GROUP).realtime(),
        )
        .unwrap();
    pubsub
        .add_data_set_writer(
            writer_group,
            DataSetWriterConfig::new("writer", DATA_SET_WRITER, ds).raw_encoded(),
        )
        .unwrap();

    let subscriber_conn = pubsub
        .add_connection(ConnectionConfig::new("subscriber", address, PUBLISHER))
        .unwrap();
    let node = NodeId(1);
    let target_cell: ExternalCell = Rc::new(RefCell::new(DataValue::new(Variant::UInt32(0))));
    let writes = Rc::new(Cell::new(0u32));
    let counter = writes.clone();
    pubsub
        .variables_mut()
        .register(
            node,
            ValueBackend::external(
                ExternalValue::new(target_cell.clone())
                    .with_write_notify(Rc::new(move |_, _| counter.set(counter.get() + 1))),
            ),
        )
        .unwrap();
    let reader_group = pubsub
        .add_reader_group(subscriber_conn, ReaderGroupConfig::new("rg").realtime())
        .unwrap();
    let reader = pubsub
        .add_data_set_reader(
            reader_group,
            DataSetReaderConfig::new(
                "reader",
                PUBLISHER,
                WRITER_GROUP,
                DATA_SET_WRITER,
                DataSetMetaData {
                    name: "demo".into(),
                    fields: vec![FieldMetaData::new("speed", BuiltInType::UInt32)],
                },
            )
            .raw_encoded()
            .with_targets(vec![TargetVariable::new(node)]),
        )
        .unwrap();

    pubsub.freeze_writer_group(writer_group).unwrap();
    pubsub.freeze_reader_group(reader_group).unwrap();

    Loopback {
        pubsub,
        writer_group,
        subscriber_conn,
        reader,
        source_cell,
        target_cell,
        writes,
    }
}

fn publish_and_receive(env: &mut Loopback) -> usize {
    // Bind the subscriber's receive socket before anything is sent.
    env.pubsub
        .receive_tick(env.subscriber_conn, Duration::ZERO)
        .unwrap();

    env.source_cell.borrow_mut().value = Variant::UInt32(1000);
    env.pubsub.publish_tick(env.writer_group).unwrap();

    let mut received = 0;
    for _ in 0..50 {
        received += env
            .pubsub
            .receive_tick(env.subscriber_conn, Duration::from_millis(100))
            .unwrap();
        if received > 0 {
            break;
        }
    }
    received
}

#[test]
fn test_rt_uint32_round_trip_over_udp_loopback() {
    let mut env = rt_loopback("opc.udp://127.0.0.1:24840/");

    let received = publish_and_receive(&mut env);
    assert_eq!(received, 1, "expected exactly one network message");

    assert_eq!(env.target_cell.borrow().value, Variant::UInt32(1000));
    assert_eq!(env.writes.get(), 1, "write callback must fire exactly once");
    assert_eq!(env.pubsub.reader_drops(env.reader).unwrap(), 0);
}

#[test]
fn test_rt_second_tick_overwrites_in_place() {
    let mut env = rt_loopback("opc.udp://127.0.0.1:24841/");

    publish_and_receive(&mut env);

    env.source_cell.borrow_mut().value = Variant::UInt32(2000);
    env.pubsub.publish_tick(env.writer_group).unwrap();
    for _ in 0..50 {
        if env
            .pubsub
            .receive_tick(env.subscriber_conn, Duration::from_millis(100))
            .unwrap()
            > 0
        {
            break;
        }
    }

    assert_eq!(env.target_cell.borrow().value, Variant::UInt32(2000));
    assert_eq!(env.writes.get(), 2);
    assert_eq!(env.pubsub.reader_drops(env.reader).unwrap(), 0);
}

/// The multicast rendition of the round trip. Ignored by default: it needs
/// a host where multicast is routable (a default route and IGMP-capable
/// interface), which bare CI containers often lack.
#[test]
#[ignore]
fn test_rt_uint32_round_trip_over_multicast() {
    let mut env = rt_loopback("opc.udp://224.0.0.22:4840/");

    let received = publish_and_receive(&mut env);
    assert_eq!(received, 1);
    assert_eq!(env.target_cell.borrow().value, Variant::UInt32(1000));
    assert_eq!(env.writes.get(), 1);
    assert_eq!(env.pubsub.reader_drops(env.reader).unwrap(), 0);
}
