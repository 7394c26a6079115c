use serde::Deserialize;

/// DeletePayload は削除イベントのペイロードを表す。
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeletePayload {
    /// 削除対象アセットの ID
    pub id: String,
    /// 削除対象のパス（任意）
    #[serde(default)]
    pub path: Option<String>,
}

/// AssetEvent はアセットイベントエンベロープをデコードした結果を表す。
///
/// 既知のイベント種別は専用のバリアントに、未知の種別は `Unknown` に分類される。
#[derive(Debug, Clone, PartialEq)]
pub enum AssetEvent {
    Delete(DeletePayload),
    Unknown { event_type: String },
}

/// RawEnvelope はワイヤ上のエンベロープ形式。
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl AssetEvent {
    /// JSON エンベロープ `{"event_type": ..., "payload": {...}}` をデコードする。
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        match raw.event_type.as_str() {
            "delete" => Ok(AssetEvent::Delete(serde_json::from_value(raw.payload)?)),
            _ => Ok(AssetEvent::Unknown {
                event_type: raw.event_type,
            }),
        }
    }

    /// イベント種別の文字列表現を返す。
    pub fn event_type(&self) -> &str {
        match self {
            AssetEvent::Delete(_) => "delete",
            AssetEvent::Unknown { event_type } => event_type,
        }
    }
}
