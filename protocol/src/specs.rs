use serde::{Deserialize, Serialize};

/// Hardware facts about the executing machine. Opaque to the job machinery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpecs {
    pub specs: serde_json::Value,
}
