//! Task trait - 型付き Task の定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`) と Associated Types (`Output`)
//! - Trait bounds の組み合わせ (Serialize + DeserializeOwned + Send + Sync + 'static)

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task_type と payload/result の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     image: String,
///     width: u32,
/// }
///
/// impl Task for Resize {
///     const TYPE: &'static str = "media.image.resize.v1";
///     type Output = String;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: envelope の payload に入れるため
/// - `DeserializeOwned`: handler 側で payload から復元するため
/// - `Send + Sync + 'static`: Arc に格納し tokio task 間で渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    /// - 例: `acme.billing.charge.v1`
    const TYPE: &'static str;

    /// Stored on the envelope as the task result.
    type Output: Serialize + DeserializeOwned + Send + 'static;
}
