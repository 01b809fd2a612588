//! End-to-end chum sync between two instances over an in-memory pipe.

use chum::{
    handshake, run_chum, ChannelSpec, Connection, FramedTransport, HandshakeConfig, Instance, Obj,
    Recipe,
};
use chum_core::{ItemType, Rule};

async fn instance(dir: &tempfile::TempDir, email: &str) -> Instance {
    let inst = Instance::create(dir.path(), email, "test-device", "pw")
        .await
        .unwrap();
    inst.store()
        .recipes()
        .register(Recipe::new(
            "Message",
            vec![Rule::new("text", ItemType::String)],
        ))
        .unwrap();
    inst
}

async fn post(inst: &Instance, channel: &str, text: &str, time: u64) {
    let data = inst
        .store()
        .store_unversioned(&Obj::new("Message").with("text", text))
        .await
        .unwrap()
        .hash;
    inst.channels()
        .insert(channel, None, data, vec![], Some(time))
        .await
        .unwrap();
}

async fn connected_pair(a: &Instance, b: &Instance) -> (Connection, Connection) {
    let (left, right) = tokio::io::duplex(1 << 20);
    let ca = Connection::new(Box::new(FramedTransport(left)));
    let cb = Connection::new(Box::new(FramedTransport(right)));
    let a_local = a.local_identity().unwrap();
    let b_local = b.local_identity().unwrap();
    let initiator = HandshakeConfig::new("chum")
        .expect_instance_key(b_local.instance_api.public_encryption_key());
    let responder = HandshakeConfig::new("chum");
    let (ra, rb) = tokio::join!(
        handshake::initiate(&ca, &a_local, &initiator),
        handshake::accept(&cb, &b_local, &responder),
    );
    ra.unwrap();
    rb.unwrap();
    (ca, cb)
}

#[tokio::test]
async fn channels_replicate_and_interleave() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = instance(&dir_a, "a@chum.test").await;
    let b = instance(&dir_b, "b@chum.test").await;

    // divergent writes on both sides of the same channel
    for (text, time) in [("a-100", 100), ("a-200", 200), ("a-300", 300)] {
        post(&a, "feed", text, time).await;
    }
    for (text, time) in [("b-150", 150), ("b-250", 250)] {
        post(&b, "feed", text, time).await;
    }

    let (ca, cb) = connected_pair(&a, &b).await;
    let specs = vec![ChannelSpec::new("feed")];
    let (pa, pb) = tokio::join!(
        run_chum(&ca, a.channels(), &specs),
        run_chum(&cb, b.channels(), &specs),
    );
    let pa = pa.unwrap();
    let pb = pb.unwrap();
    assert!(pa.errors.is_empty(), "{:?}", pa.errors);
    assert!(pb.errors.is_empty(), "{:?}", pb.errors);
    assert!(pa.objects_received > 0);
    assert!(pb.objects_received > 0);

    // both sides converge on the interleaved chain
    for inst in [&a, &b] {
        let entries = inst.channels().entries("feed", None).await.unwrap();
        let times: Vec<u64> = entries.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![300, 250, 200, 150, 100]);
        for entry in &entries {
            // every replicated data object resolves
            inst.store().get_object(&entry.data).await.unwrap();
        }
    }
    let head_a = a.channels().head("feed", None).await.unwrap();
    let head_b = b.channels().head("feed", None).await.unwrap();
    assert_eq!(head_a, head_b);
}

#[tokio::test]
async fn second_sync_is_a_no_op() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = instance(&dir_a, "a@chum.test").await;
    let b = instance(&dir_b, "b@chum.test").await;
    post(&a, "feed", "only", 100).await;

    let specs = vec![ChannelSpec::new("feed")];
    let (ca, cb) = connected_pair(&a, &b).await;
    let (pa, pb) = tokio::join!(
        run_chum(&ca, a.channels(), &specs),
        run_chum(&cb, b.channels(), &specs),
    );
    pa.unwrap();
    assert_eq!(pb.unwrap().objects_received, 3);

    let (ca, cb) = connected_pair(&a, &b).await;
    let (pa, pb) = tokio::join!(
        run_chum(&ca, a.channels(), &specs),
        run_chum(&cb, b.channels(), &specs),
    );
    assert_eq!(pa.unwrap().objects_received, 0);
    assert_eq!(pb.unwrap().objects_received, 0);
    assert_eq!(
        b.channels().entries("feed", None).await.unwrap().len(),
        1
    );
}
