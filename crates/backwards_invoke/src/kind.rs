use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

// -----------------------------------------------------------------------------
// Invocation kinds the daemon services on behalf of a plugin
// -----------------------------------------------------------------------------

/// Tag identifying which remote operation a backwards request performs.
///
/// The runtime is generic over the kind; this list only fixes the wire names
/// the daemon understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvokeType {
    Tool,
    Llm,
    TextEmbedding,
    Rerank,
    Tts,
    #[strum(serialize = "speech2text")]
    #[serde(rename = "speech2text")]
    Speech2Text,
    Moderation,
    App,
    NodeParameterExtractor,
    NodeQuestionClassifier,
    Storage,
    Summary,
    UploadFile,
    FetchApp,
}
