use crate::types::StationStatus;

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Retrieve Data</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:760px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    button{font-size:18px;padding:15px 25px;margin:10px 10px 0 0;cursor:pointer}
    input[type=number]{font-size:18px;padding:10px;width:200px;margin:10px 0}
    pre{font-size:18px;white-space:pre-wrap;word-wrap:break-word}
    .muted{color:#555}
    p{font-size:18px;margin:.35rem 0}
  </style>
</head>
<body>
  <h1>Retrieve Data</h1>
  <p class="muted">Temperature data is being logged.</p>
  <p>Sensor ID: {{sensor_id}}</p>
  <p class="muted">Clock: <span id="clock">{{clock}}</span></p>

  <div class="card">
    <button onclick="sendTime()">Set Time from Phone</button>
    <button onclick="setGPS()">Set GPS Coordinates</button>
    <button onclick="window.location.href='/download'">Download Data</button>
    <button onclick="deleteData()">Delete Data</button>
  </div>

  <div class="card">
    <h2>Adjust Record Interval</h2>
    <p>Enter time between records (in minutes):</p>
    <input type="number" id="interval" value="{{interval}}" min="1">
    <button onclick="setRecordInterval()">Set Interval</button>
  </div>

  <div class="card">
    <h2>GPS Coordinates</h2>
    <p id="gps-coords">{{gps}}</p>
  </div>

  <div class="card">
    <h2>Measurement Counter</h2>
    <p>Measurement Count: {{count}}</p>
    <h2>Last Recorded Data</h2>
    <pre>{{last_reading}}</pre>
  </div>

  <div class="card">
    <h2>Start Measurements</h2>
    <button id="goButton" onclick="confirmStart()">Go</button>
  </div>

  <script>
    async function post(path,fields){
      const r=await fetch(path,{method:'POST',headers:{'content-type':'application/x-www-form-urlencoded'},body:new URLSearchParams(fields)});
      return r.text();
    }

    async function sendTime(){
      const now=new Date();
      alert(await post('/set-time',{time:now.toISOString(),offset:String(now.getTimezoneOffset())}));
    }

    async function setGPS(){
      const gps=prompt('Enter GPS coordinates (latitude, longitude):');
      if(!gps)return;
      alert(await post('/set-gps',{gps}));
      document.getElementById('gps-coords').innerText=gps;
    }

    async function deleteData(){
      if(!confirm('Are you sure you want to delete all data?'))return;
      await fetch('/delete');
      location.reload();
    }

    async function setRecordInterval(){
      const interval=document.getElementById('interval').value;
      if(!(Number(interval)>=1)){alert('Interval must be at least 1 minute.');return;}
      alert(await post('/set-interval',{interval}));
    }

    async function confirmStart(){
      if(!confirm('Start measurements?'))return;
      alert(await (await fetch('/start-measurements')).text());
    }
  </script>
</body>
</html>
"#;

pub fn render_index(status: &StationStatus) -> String {
    INDEX_HTML
        .replace("{{sensor_id}}", &escape_html(&status.sensor_id))
        .replace("{{clock}}", &escape_html(&status.clock))
        .replace("{{interval}}", &status.interval_minutes.to_string())
        .replace("{{gps}}", &escape_html(&status.gps))
        .replace("{{count}}", &status.measurement_count.to_string())
        .replace("{{last_reading}}", &escape_html(&status.last_reading))
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(gps: &str) -> StationStatus {
        StationStatus {
            sensor_id: "28:ff:4:1e:f:4c:2a:9c".into(),
            interval_minutes: 15,
            gps: gps.into(),
            measurement_count: 42,
            last_reading: "20240101 10:00;21.50".into(),
            clock: "20240101 10:01".into(),
        }
    }

    #[test]
    fn fills_every_placeholder() {
        let html = render_index(&status("48.85, 2.35"));

        assert!(!html.contains("{{"));
        assert!(html.contains(r#"id="interval" value="15""#));
        assert!(html.contains("Measurement Count: 42"));
        assert!(html.contains("<pre>20240101 10:00;21.50</pre>"));
    }

    #[test]
    fn escapes_user_supplied_gps() {
        let html = render_index(&status("<script>alert(1)</script>"));

        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(!html.contains("<script>alert(1)"));
    }
}
