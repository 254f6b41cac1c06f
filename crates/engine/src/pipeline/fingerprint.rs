//! Device presets for Stage B browser contexts and the init script that makes
//! the page observe them.

use rand::{seq::SliceRandom, Rng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePreset {
    pub platform: &'static str,
    pub hardware_concurrency: u8,
    pub device_memory: u8,
    pub webgl_vendor: &'static str,
    pub webgl_renderer: &'static str,
    pub viewport: (u32, u32),
    pub user_agent: &'static str,
}

pub const DEVICE_PRESETS: [DevicePreset; 4] = [
    DevicePreset {
        platform: "MacIntel",
        hardware_concurrency: 10,
        device_memory: 16,
        webgl_vendor: "Intel Inc.",
        webgl_renderer: "Intel Iris Plus Graphics 655",
        viewport: (1440, 900),
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    },
    DevicePreset {
        platform: "MacIntel",
        hardware_concurrency: 8,
        device_memory: 8,
        webgl_vendor: "Apple Inc.",
        webgl_renderer: "Apple M1",
        viewport: (1512, 982),
        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    },
    DevicePreset {
        platform: "Win32",
        hardware_concurrency: 12,
        device_memory: 32,
        webgl_vendor: "Google Inc. (NVIDIA)",
        webgl_renderer: "ANGLE (NVIDIA, NVIDIA GeForce RTX 3070 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        viewport: (1920, 1080),
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    },
    DevicePreset {
        platform: "Win32",
        hardware_concurrency: 8,
        device_memory: 16,
        webgl_vendor: "Google Inc. (Intel)",
        webgl_renderer: "ANGLE (Intel, Intel(R) UHD Graphics 620 Direct3D11 vs_5_0 ps_5_0, D3D11)",
        viewport: (1366, 768),
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    },
];

/// Timezone and primary language travel together.
pub const LOCALES: [(&str, &str); 5] = [
    ("America/New_York", "en-US"),
    ("America/Los_Angeles", "en-US"),
    ("Europe/London", "en-GB"),
    ("Europe/Berlin", "de-DE"),
    ("Europe/Moscow", "ru-RU"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub device: DevicePreset,
    pub timezone: &'static str,
    pub language: &'static str,
    /// Seeds canvas noise; stable for the lifetime of one context.
    pub noise_seed: u32,
    /// Offset added to audio frequency samples.
    pub audio_offset: f64,
}

impl Fingerprint {
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        let device = *DEVICE_PRESETS
            .choose(rng)
            .unwrap_or(&DEVICE_PRESETS[0]);
        let (timezone, language) = *LOCALES.choose(rng).unwrap_or(&LOCALES[0]);
        Self {
            device,
            timezone,
            language,
            noise_seed: rng.gen(),
            audio_offset: rng.gen_range(0.0001..0.001),
        }
    }

    pub fn languages(&self) -> Vec<&'static str> {
        let base = self.language.split('-').next().unwrap_or(self.language);
        if self.language == "en-US" {
            vec!["en-US", "en"]
        } else {
            vec![self.language, base, "en-US", "en"]
        }
    }

    /// Script evaluated before any page script in every new document.
    pub fn init_script(&self) -> String {
        let languages = serde_json::to_string(&self.languages()).unwrap_or_else(|_| "[]".into());
        format!(
            r#"(() => {{
  const define = (obj, key, value) => Object.defineProperty(obj, key, {{ get: () => value, configurable: true }});
  define(Navigator.prototype, 'webdriver', undefined);
  define(Navigator.prototype, 'platform', {platform:?});
  define(Navigator.prototype, 'hardwareConcurrency', {cores});
  define(Navigator.prototype, 'deviceMemory', {memory});
  define(Navigator.prototype, 'language', {language:?});
  define(Navigator.prototype, 'languages', Object.freeze({languages}));
  const plugins = ['PDF Viewer', 'Chrome PDF Viewer', 'Chromium PDF Viewer', 'Microsoft Edge PDF Viewer', 'WebKit built-in PDF']
    .map((name) => ({{ name, filename: 'internal-pdf-viewer', description: 'Portable Document Format', length: 1 }}));
  define(Navigator.prototype, 'plugins', Object.freeze(plugins));
  if ('getBattery' in Navigator.prototype) {{ delete Navigator.prototype.getBattery; }}

  let seed = {seed} >>> 0;
  const next = () => {{ seed = (seed * 1664525 + 1013904223) >>> 0; return seed; }};
  const noisify = (data) => {{ for (let i = 0; i < data.length; i += 4) {{ data[i] ^= next() & 1; }} }};
  const getImageData = CanvasRenderingContext2D.prototype.getImageData;
  CanvasRenderingContext2D.prototype.getImageData = function (...args) {{
    const image = getImageData.apply(this, args);
    noisify(image.data);
    return image;
  }};
  const toDataURL = HTMLCanvasElement.prototype.toDataURL;
  HTMLCanvasElement.prototype.toDataURL = function (...args) {{
    const ctx = this.getContext('2d');
    if (ctx && this.width && this.height) {{
      const image = getImageData.call(ctx, 0, 0, this.width, this.height);
      noisify(image.data);
      ctx.putImageData(image, 0, 0);
    }}
    return toDataURL.apply(this, args);
  }};

  for (const proto of [WebGLRenderingContext.prototype, window.WebGL2RenderingContext && WebGL2RenderingContext.prototype]) {{
    if (!proto) continue;
    const getParameter = proto.getParameter;
    proto.getParameter = function (param) {{
      if (param === 37445) return {vendor:?};
      if (param === 37446) return {renderer:?};
      return getParameter.call(this, param);
    }};
  }}

  if (window.AnalyserNode) {{
    const getFloat = AnalyserNode.prototype.getFloatFrequencyData;
    AnalyserNode.prototype.getFloatFrequencyData = function (array) {{
      getFloat.call(this, array);
      for (let i = 0; i < array.length; i++) {{ array[i] += {audio}; }}
    }};
  }}
}})();"#,
            platform = self.device.platform,
            cores = self.device.hardware_concurrency,
            memory = self.device.device_memory,
            language = self.language,
            languages = languages,
            seed = self.noise_seed,
            vendor = self.device.webgl_vendor,
            renderer = self.device.webgl_renderer,
            audio = self.audio_offset,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn sample_draws_from_closed_sets() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..32 {
            let fingerprint = Fingerprint::sample(&mut rng);
            assert!(DEVICE_PRESETS.contains(&fingerprint.device));
            assert!(LOCALES.contains(&(fingerprint.timezone, fingerprint.language)));
            assert!(fingerprint.audio_offset > 0.0 && fingerprint.audio_offset < 0.001);
        }
    }

    #[test]
    fn init_script_reflects_preset() {
        let fingerprint = Fingerprint {
            device: DEVICE_PRESETS[1],
            timezone: "Europe/Berlin",
            language: "de-DE",
            noise_seed: 42,
            audio_offset: 0.0005,
        };
        let script = fingerprint.init_script();
        assert!(script.contains(r#"'platform', "MacIntel""#));
        assert!(script.contains(r#"return "Apple M1""#));
        assert!(script.contains("'hardwareConcurrency', 8"));
        assert!(script.contains(r#"["de-DE","de","en-US","en"]"#));
        assert!(script.contains("'webdriver', undefined"));
        assert!(script.contains("delete Navigator.prototype.getBattery"));
    }
}
