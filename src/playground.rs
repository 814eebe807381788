//! Embedded playground assets.
//!
//! The HTML is intentionally self-contained (no external assets beyond the
//! logo route) so the gateway serves it from memory.

/// The `/` playground page: a minimal console that lists the schema and
/// fires tool invocations against `/execute/{name}`.
pub const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>vakt playground</title>
<style>
  body { font-family: ui-monospace, monospace; margin: 2rem auto; max-width: 60rem; }
  header { display: flex; align-items: center; gap: .75rem; }
  header img { width: 2rem; height: 2rem; }
  textarea { width: 100%; height: 8rem; }
  pre { background: #f4f4f4; padding: 1rem; overflow: auto; }
  select, input, button { font: inherit; margin: .25rem 0; }
</style>
</head>
<body>
<header><img src="/logo.svg" alt=""><h1>vakt playground</h1></header>
<p>
  <label>token <input id="token" type="password" placeholder="bearer token"></label>
</p>
<p>
  <label>tool <select id="tool"></select></label>
  <button id="run">execute</button>
</p>
<textarea id="params">{}</textarea>
<pre id="out">—</pre>
<script>
const out = document.getElementById('out');
const tool = document.getElementById('tool');
fetch('/api/schema').then(r => r.json()).then(s => {
  for (const t of s.tools) {
    const o = document.createElement('option');
    o.value = t.name; o.textContent = t.name;
    tool.appendChild(o);
  }
});
document.getElementById('run').onclick = async () => {
  const token = document.getElementById('token').value;
  const params = document.getElementById('params').value;
  try {
    const resp = await fetch('/execute/' + tool.value, {
      method: 'POST',
      headers: { 'Content-Type': 'application/json', 'Authorization': 'Bearer ' + token },
      body: params,
    });
    out.textContent = JSON.stringify(await resp.json(), null, 2);
  } catch (e) {
    out.textContent = String(e);
  }
};
</script>
</body>
</html>
"#;

/// The `/logo.svg` asset.
pub const LOGO_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 32 32">
<rect x="2" y="2" width="28" height="28" rx="6" fill="#1f2430"/>
<path d="M8 10l8 14 8-14" fill="none" stroke="#7aa2f7" stroke-width="3" stroke-linecap="round" stroke-linejoin="round"/>
</svg>
"##;
