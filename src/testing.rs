//! 测试辅助：在临时端口上启动进程内的 axum 假上游。

use axum::Router;
use tokio::net::TcpListener;

/// 启动路由并返回 `http://127.0.0.1:<port>`。
pub(crate) async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}
