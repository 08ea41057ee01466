/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2021 Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use super::FilterLog;

impl FilterLog {
    /// Returns the root mean square of the prefit residuals of the processed observations
    pub fn rms_prefit_residuals(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0;
        for stats in self.iter().filter_map(|rec| rec.measurement.as_ref()) {
            sum += stats.prefit.dot(&stats.prefit);
            count += 1;
        }
        if count == 0 {
            return 0.0;
        }
        (sum / (count as f64)).sqrt()
    }

    /// Returns the root mean square of the postfit residuals of the accepted observations
    pub fn rms_postfit_residuals(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0;
        for postfit in self
            .iter()
            .filter_map(|rec| rec.measurement.as_ref())
            .filter_map(|stats| stats.postfit.as_ref())
        {
            sum += postfit.dot(postfit);
            count += 1;
        }
        if count == 0 {
            return 0.0;
        }
        (sum / (count as f64)).sqrt()
    }

    /// Number of accepted and rejected observations.
    pub fn measurement_counts(&self) -> (usize, usize) {
        self.iter()
            .filter_map(|rec| rec.measurement.as_ref())
            .fold((0, 0), |(accepted, rejected), stats| {
                if stats.accepted() {
                    (accepted + 1, rejected)
                } else {
                    (accepted, rejected + 1)
                }
            })
    }
}
