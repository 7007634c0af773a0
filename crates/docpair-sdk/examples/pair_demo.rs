//! 文档对演示
//!
//! 使用内存监听源和回显提交器，展示本地编辑、提交、回显和重连的完整流程

use std::sync::Arc;
use std::time::Duration;

use docpair_sdk::test_helpers::{snapshot_event, EchoCommitter, MemoryListener};
use docpair_sdk::{DocumentStore, ListenerEvent, PairConfig, PatchOperations};
use futures::StreamExt;
use serde_json::json;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n==============================================");
    println!("📝 文档对演示");
    println!("==============================================\n");

    let listener = MemoryListener::new();
    let committer = Arc::new(EchoCommitter::new(listener.clone()));
    let store = DocumentStore::new(
        Arc::new(listener.clone()),
        committer.clone(),
        PairConfig::default(),
    );

    let pair = store.checkout("article-1")?;
    let draft = pair.draft();
    let published = pair.published();

    // 订阅输出流（第一个订阅会打开共享监听）
    let mut draft_events = draft.events();
    let mut draft_consistency = draft.consistency();
    let mut published_snapshots = published.remote_snapshots();

    tokio::spawn(async move {
        while let Some(event) = draft_events.next().await {
            println!("  📨 [{}] {}", event.version, event.event.event_type());
        }
    });
    tokio::spawn(async move {
        while let Some(consistent) = draft_consistency.next().await {
            println!("  {} draft 一致性: {}", if consistent { "✅" } else { "⏳" }, consistent);
        }
    });

    // 场景 1: 初始快照
    println!("\n场景 1: 服务端推送两个版本的快照");
    listener.emit(snapshot_event(
        "drafts.article-1",
        Some(json!({"_id": "drafts.article-1", "_rev": "d1", "title": "Draft", "views": 0})),
        Some("d1"),
    ));
    listener.emit(snapshot_event(
        "article-1",
        Some(json!({"_id": "article-1", "_rev": "p1", "title": "Live"})),
        Some("p1"),
    ));
    committer.seed_revision("drafts.article-1", "d1");
    committer.seed_revision("article-1", "p1");

    if let Some(snapshot) = published_snapshots.next().await {
        println!("  📄 published 远端快照: {:?}", snapshot.snapshot.document);
    }
    sleep(Duration::from_millis(50)).await;

    // 场景 2: 本地编辑并提交
    println!("\n场景 2: 编辑草稿并提交");
    draft.mutate(draft.patch(vec![PatchOperations::new()
        .set("title", json!("Draft v2"))
        .inc("views", json!(1))]))?;
    println!("  ✏️ 本地快照: {:?}", draft.snapshot());
    println!("  ⏳ 待确认事务: {}", draft.pending_count());

    draft.commit().await?;
    sleep(Duration::from_millis(50)).await;
    println!("  ✅ 回显后待确认事务: {}", draft.pending_count());

    // 场景 3: 重连
    println!("\n场景 3: 监听重连");
    listener.emit(ListenerEvent::Reconnect);
    sleep(Duration::from_millis(50)).await;
    println!("  🔁 draft 连续投递: {}", draft.is_gapless());

    let stats = pair.listener_stats();
    println!("\n📊 监听统计: {:?}", stats);

    println!("\n==============================================");
    println!("✅ 演示完成");
    println!("==============================================\n");

    Ok(())
}
