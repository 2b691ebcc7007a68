/*!
# MeshWatch DevKit - test support for the gateway and its tools

- Fluent builders for machine telemetry payloads, valid or deliberately broken
- Meshtastic JSON envelope helpers
- A mock mesh link that records publishes and simulates incoming packets
- A recorder for snapshot/update frames received by a subscriber
*/

pub mod frames;
pub mod mesh_link;
pub mod telemetry;

pub use frames::{Frame, FrameRecorder};
pub use mesh_link::{MeshEnvelope, MeshPacket, MockMeshLink};
pub use telemetry::TelemetryBuilder;
