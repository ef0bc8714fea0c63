use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;

lazy_static! {
    pub static ref PEER_PROPOSAL_COUNTER: IntCounterVec = IntCounterVec::new(
        Opts::new("proposal_total", "Total number of proposals by policy"),
        &["type"]
    )
    .expect("metric can be created");
    pub static ref PEER_ADMIN_CMD_COUNTER: IntCounterVec = IntCounterVec::new(
        Opts::new("admin_cmd_total", "Total number of admin commands by type"),
        &["type"]
    )
    .expect("metric can be created");
    pub static ref RAFT_READY_COUNTER: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_ready_total", "Total number of handled raft ready phases"),
        &["type"]
    )
    .expect("metric can be created");
    pub static ref CUSTOM_REGISTRY: Registry =
        Registry::new_custom(Some("multiraft".to_owned()), None).expect("registry can be created");
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(PEER_PROPOSAL_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PEER_ADMIN_CMD_COUNTER.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(RAFT_READY_COUNTER.clone()))
        .expect("collector can be registered");
}
