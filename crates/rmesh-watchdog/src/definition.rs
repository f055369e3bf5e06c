// SPDX-License-Identifier: MIT OR Apache-2.0
//! Static definitions of the supervised backend services.

/// Health probe for a fallback-eligible service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    /// Endpoint to GET.
    pub url: String,
    /// Substring that marks the endpoint healthy.
    pub expect: String,
}

/// One supervised backend service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Stable service name, also the assignment key.
    pub name: String,
    /// Upstream repository holding the service script.
    pub repo_url: String,
    /// Script path inside the repository.
    pub script_path: String,
    /// Human-readable description.
    pub description: String,
    /// Well-known ports to free before launch.
    pub ports: Vec<u16>,
    /// Present for the fallback-eligible service; drives the probe loop.
    pub health: Option<HealthProbe>,
    /// Interpreter used to run the script.
    pub interpreter: String,
}

impl ServiceDefinition {
    /// The script's bare file name.
    pub fn script_name(&self) -> &str {
        self.script_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.script_path)
    }

    /// Whether this service may fall back to a pre-existing system instance.
    pub fn fallback_eligible(&self) -> bool {
        self.health.is_some()
    }
}

/// The stock service set: speech-to-text, text-to-speech, and the
/// language-model proxy.
pub fn default_definitions() -> Vec<ServiceDefinition> {
    vec![
        ServiceDefinition {
            name: "piper_tts".into(),
            repo_url: "https://github.com/robit-man/piper-tts-service.git".into(),
            script_path: "tts/tts_service.py".into(),
            description: "Piper text-to-speech REST service".into(),
            ports: vec![8123],
            health: None,
            interpreter: "python3".into(),
        },
        ServiceDefinition {
            name: "whisper_asr".into(),
            repo_url: "https://github.com/robit-man/whisper-asr-service.git".into(),
            script_path: "asr/asr_service.py".into(),
            description: "Whisper ASR streaming/batch REST service".into(),
            ports: vec![8126],
            health: None,
            interpreter: "python3".into(),
        },
        ServiceDefinition {
            name: "ollama_farm".into(),
            repo_url: "https://github.com/robit-man/ollama-nkn-relay.git".into(),
            script_path: "farm/ollama_farm.py".into(),
            description: "Ollama parallel proxy with concurrency guard".into(),
            ports: vec![11434, 8080],
            health: Some(HealthProbe {
                url: "http://127.0.0.1:11434/".into(),
                expect: "Ollama is running".into(),
            }),
            interpreter: "python3".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_set_has_one_fallback_service() {
        let defs = default_definitions();
        assert_eq!(defs.len(), 3);
        let fallback: Vec<_> = defs.iter().filter(|d| d.fallback_eligible()).collect();
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].name, "ollama_farm");
        assert_eq!(
            fallback[0].health.as_ref().unwrap().expect,
            "Ollama is running"
        );
    }

    #[test]
    fn script_name_strips_directories() {
        let defs = default_definitions();
        assert_eq!(defs[0].script_name(), "tts_service.py");
        assert_eq!(defs[1].script_name(), "asr_service.py");
    }
}
