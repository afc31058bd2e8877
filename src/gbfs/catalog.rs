//! The public GBFS systems catalog (`systems.csv`).

use anyhow::{Result, bail};
use serde::Deserialize;

/// One row of the systems catalog.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct System {
    #[serde(rename = "Country Code", default)]
    pub country_code: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Location", default)]
    pub location: String,
    #[serde(rename = "System ID")]
    pub system_id: String,
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(rename = "Auto-Discovery URL")]
    pub auto_discovery_url: String,
}

#[derive(Debug, Clone)]
pub struct SystemCatalog {
    systems: Vec<System>,
}

impl SystemCatalog {
    /// Parses the catalog CSV. Columns beyond the ones in [`System`] are
    /// ignored.
    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(bytes);

        let mut systems = Vec::new();
        for record in rdr.deserialize() {
            let system: System = record?;
            systems.push(system);
        }
        Ok(Self { systems })
    }

    /// Looks a system up by ID, exactly first and then ignoring case.
    ///
    /// # Errors
    ///
    /// An unknown name is a configuration error listing the known IDs.
    pub fn find(&self, name: &str) -> Result<&System> {
        let found = self
            .systems
            .iter()
            .find(|s| s.system_id == name)
            .or_else(|| {
                self.systems
                    .iter()
                    .find(|s| s.system_id.eq_ignore_ascii_case(name))
            });

        match found {
            Some(system) => Ok(system),
            None => bail!(
                "system '{name}' not found in the GBFS catalog. Available systems: {}",
                self.system_ids().join(", ")
            ),
        }
    }

    pub fn system_ids(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.system_id.as_str()).collect()
    }

    pub fn systems(&self) -> &[System] {
        &self.systems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = "\
Country Code,Name,Location,System ID,URL,Auto-Discovery URL,Supported Versions,Authentication Info URL,Authentication Type,Authentication Parameter Name
FR,Vélib' Métropole,\"Paris, FR\",Paris,https://www.velib-metropole.fr,https://velib-metropole-opendata.smovengo.cloud/opendata/Velib_Metropole/gbfs.json,1.0 ; 2.0,,,
US,Citi Bike,\"New York, NY\",NYC,https://www.citibikenyc.com,https://gbfs.citibikenyc.com/gbfs/2.3/gbfs.json,2.3,,,
";

    #[test]
    fn test_parse_catalog() {
        let catalog = SystemCatalog::from_csv(CATALOG.as_bytes()).unwrap();
        assert_eq!(catalog.systems().len(), 2);
        assert_eq!(catalog.system_ids(), vec!["Paris", "NYC"]);
        assert_eq!(catalog.systems()[0].location, "Paris, FR");
    }

    #[test]
    fn test_find_exact_and_case_insensitive() {
        let catalog = SystemCatalog::from_csv(CATALOG.as_bytes()).unwrap();

        let paris = catalog.find("Paris").unwrap();
        assert!(paris.auto_discovery_url.ends_with("gbfs.json"));

        assert_eq!(catalog.find("nyc").unwrap().system_id, "NYC");
    }

    #[test]
    fn test_unknown_system_lists_available() {
        let catalog = SystemCatalog::from_csv(CATALOG.as_bytes()).unwrap();

        let err = catalog.find("Atlantis").unwrap_err().to_string();

        assert!(err.contains("Atlantis"));
        assert!(err.contains("Paris, NYC"));
    }

    #[test]
    fn test_missing_required_column_is_error() {
        let csv = "Name,System ID\nFoo,foo\n";
        assert!(SystemCatalog::from_csv(csv.as_bytes()).is_err());
    }
}
