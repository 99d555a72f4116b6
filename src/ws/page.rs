//! `GET /`: Browser test page for the demo chat.

use axum::response::Html;

const CHAT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>wsbroker chat</title>
    <style>
        body { font-family: sans-serif; margin: 20px; }
        #log { border: 1px solid #ccc; height: 300px; overflow-y: scroll; padding: 10px; margin: 10px 0; }
        #input { width: 300px; padding: 5px; }
        .welcome { color: green; }
        .system { color: blue; }
    </style>
</head>
<body>
    <h1>wsbroker chat</h1>
    <div id="log"></div>
    <input type="text" id="input" placeholder="Type a message..." />
    <button onclick="send()">Send</button>
    <button onclick="ws.close()">Disconnect</button>
    <script>
        const log = document.getElementById('log');
        const input = document.getElementById('input');
        const params = new URLSearchParams(location.search);
        const query = params.has('id') ? '?id=' + encodeURIComponent(params.get('id')) : '';
        const ws = new WebSocket((location.protocol === 'https:' ? 'wss://' : 'ws://') + location.host + '/ws' + query);

        function add(text, cls) {
            const div = document.createElement('div');
            div.className = cls;
            div.textContent = text;
            log.appendChild(div);
            log.scrollTop = log.scrollHeight;
        }

        ws.onopen = () => add('Connected to server', 'system');
        ws.onclose = () => add('Disconnected from server', 'system');
        ws.onmessage = (event) => {
            try {
                const data = JSON.parse(event.data);
                if (data.type === 'welcome') {
                    add(data.message, 'welcome');
                } else {
                    add('[' + data.timestamp + '] ' + data.from + ': ' + data.content, 'message');
                }
            } catch (e) {
                add(event.data, 'message');
            }
        };

        function send() {
            const text = input.value.trim();
            if (text && ws.readyState === WebSocket.OPEN) {
                ws.send(text);
                input.value = '';
            }
        }
        input.addEventListener('keypress', (e) => { if (e.key === 'Enter') send(); });
    </script>
</body>
</html>
"#;

/// Serves the chat test page.
pub async fn chat_page() -> Html<&'static str> {
    Html(CHAT_PAGE)
}
