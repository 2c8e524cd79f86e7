//! Actor components

pub mod mission_bus;

pub use mission_bus::{
    MissionBus, MissionBusActor, MissionBusArguments, MissionBusConfig, MissionBusError,
    MissionBusMsg, MissionSubscription,
};
